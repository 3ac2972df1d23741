//! Configuration management for Applier
//!
//! Every timing constant and every site selector lives here so the core logic
//! never hard-codes markup. Loaded from `.applier/config.toml`; missing fields
//! take the defaults below.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::{ApplierError, Result};

/// Reconnect delays below this would hammer the job source
pub const MIN_RECONNECT_DELAY_MS: u64 = 1000;
/// Lowest accepted login poll interval
pub const MIN_LOGIN_POLL_INTERVAL_MS: u64 = 1000;
/// Lowest accepted interval between liveness probes
pub const MIN_PROBE_INTERVAL_MS: u64 = 100;

/// Top-level Applier configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplierConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub site: SiteConfig,

    #[serde(default)]
    pub browser: BrowserConfig,
}

/// Remote job source endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the job source API (session bootstrap lives at `{api_url}/session`)
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

/// Session transport timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Fixed delay before reconnecting after an abnormal closure
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Interval of the recurring login-status poll
    #[serde(default = "default_login_poll_interval_ms")]
    pub login_poll_interval_ms: u64,

    /// Terminal job reports kept while disconnected
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Cross-context dispatch timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Liveness probes sent before giving up on a page agent
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Wait between two liveness probes
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Upper bound for any single page request
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Deferred requests are acknowledged after this long if the handler is still busy
    #[serde(default = "default_ack_fallback_ms")]
    pub ack_fallback_ms: u64,
}

/// Page agent timing and policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Wait after a page load before resuming persisted work
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Wait after page readiness for asynchronously rendered content
    #[serde(default = "default_dynamic_content_delay_ms")]
    pub dynamic_content_delay_ms: u64,

    /// Wait between two jobs of the same queue
    #[serde(default = "default_inter_job_delay_ms")]
    pub inter_job_delay_ms: u64,

    /// Page readiness deadline
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Deadline for a form field or button to appear
    #[serde(default = "default_element_timeout_ms")]
    pub element_timeout_ms: u64,

    /// Deadline for a success indicator after submitting
    #[serde(default = "default_success_timeout_ms")]
    pub success_timeout_ms: u64,

    /// Report `success: false` when no success indicator was observed
    #[serde(default)]
    pub require_confirmation: bool,

    /// Navigations to one job page before the job fails; redirects that
    /// never land on the job URL would otherwise loop
    #[serde(default = "default_max_navigations")]
    pub max_navigations: u32,
}

/// Target site description: URLs and selector lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Host suffix identifying pages of the target site
    #[serde(default = "default_host")]
    pub host: String,

    /// Page opened when no tab shows the target site
    #[serde(default = "default_home_url")]
    pub home_url: String,

    /// Path fragments only reachable when logged in
    #[serde(default = "default_logged_in_paths")]
    pub logged_in_paths: Vec<String>,

    /// Path fragment of the login page
    #[serde(default = "default_login_path")]
    pub login_path: String,

    #[serde(default = "default_cover_letter_selectors")]
    pub cover_letter_selectors: Vec<String>,

    #[serde(default = "default_submit_selectors")]
    pub submit_selectors: Vec<String>,

    /// Text needles for the semantic submit-button fallback (case-insensitive)
    #[serde(default = "default_submit_texts")]
    pub submit_texts: Vec<String>,

    /// Visible account-menu-like elements proving a logged-in session
    #[serde(default = "default_login_indicators")]
    pub login_indicators: Vec<String>,

    /// Elements that only exist on a login form
    #[serde(default = "default_login_form_indicators")]
    pub login_form_indicators: Vec<String>,

    /// Elements that may carry a submission confirmation
    #[serde(default = "default_success_indicators")]
    pub success_indicators: Vec<String>,

    /// Text a success indicator must contain (case-insensitive)
    #[serde(default = "default_success_keywords")]
    pub success_keywords: Vec<String>,
}

/// Headless browser used as page host by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,

    /// How often the page is re-read to detect mutations and reloads
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Navigation timeout in seconds
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
}

// Default value providers
fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_login_poll_interval_ms() -> u64 {
    10_000
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_probe_attempts() -> u32 {
    10
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_ack_fallback_ms() -> u64 {
    100
}

fn default_settle_delay_ms() -> u64 {
    10_000
}

fn default_dynamic_content_delay_ms() -> u64 {
    5000
}

fn default_inter_job_delay_ms() -> u64 {
    5000
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_element_timeout_ms() -> u64 {
    5000
}

fn default_success_timeout_ms() -> u64 {
    10_000
}

fn default_max_navigations() -> u32 {
    3
}

fn default_host() -> String {
    "upwork.com".to_string()
}

fn default_home_url() -> String {
    "https://www.upwork.com".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_logged_in_paths() -> Vec<String> {
    strings(&["/nx/", "/find-work/", "/dashboard", "/jobs/", "/messages/", "/proposals/"])
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_cover_letter_selectors() -> Vec<String> {
    strings(&[
        r#"textarea[name="coverLetter"]"#,
        r#"textarea[data-test="cover-letter"]"#,
        r#"textarea[placeholder*="cover letter"]"#,
        r#"textarea[placeholder*="proposal"]"#,
        r#"textarea[placeholder*="message"]"#,
    ])
}

fn default_submit_selectors() -> Vec<String> {
    strings(&[
        r#"button[data-test="submit-btn"]"#,
        r#"button[data-cy="submit-btn"]"#,
        r#"button[data-test="submit-proposal-btn"]"#,
        r#"button[data-cy="submit-proposal-btn"]"#,
        r#"button[type="submit"]"#,
        r#"input[type="submit"]"#,
        ".submit-proposal-btn",
        ".apply-btn",
        r#"button[class*="submit"]"#,
        r#"button[class*="proposal"]"#,
        r#"button[class*="apply"]"#,
        r#"[data-test*="submit"]"#,
        r#"[data-cy*="submit"]"#,
        r#"button[aria-label*="Submit"]"#,
        r#"button[aria-label*="Apply"]"#,
    ])
}

fn default_submit_texts() -> Vec<String> {
    strings(&["submit", "apply", "propose", "send"])
}

fn default_login_indicators() -> Vec<String> {
    strings(&[
        r#"[data-test="user-menu"]"#,
        ".user-menu",
        r#"[data-cy="user-menu"]"#,
        ".upwork-header-user",
        r#"a[href*="/logout"]"#,
        ".user-profile",
        r#"[data-test="user-avatar"]"#,
        ".user-avatar",
        ".user-dropdown",
        r#"[data-test="user-dropdown"]"#,
        ".header-user",
        ".user-info",
        r#"button[aria-label*="user"]"#,
        r#"button[aria-label*="profile"]"#,
        ".user-menu-toggle",
        r#"[data-test="user-menu-toggle"]"#,
    ])
}

fn default_login_form_indicators() -> Vec<String> {
    strings(&[
        r#"input[name="username"]"#,
        r#"input[name="email"]"#,
        r#"input[type="email"]"#,
        ".login-form",
        r#"[data-test="login-form"]"#,
    ])
}

fn default_success_indicators() -> Vec<String> {
    strings(&[".success-message", ".alert-success", r#"[data-test="success"]"#])
}

fn default_success_keywords() -> Vec<String> {
    strings(&["proposal", "applied", "submitted"])
}

fn default_headless() -> bool {
    true
}

fn default_window_width() -> u32 {
    1920
}

fn default_window_height() -> u32 {
    1080
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_navigation_timeout_secs() -> u64 {
    30
}

impl ApplierConfig {
    /// Load configuration from `.applier/config.toml` under `root`, or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".applier/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration text and clamp out-of-range values
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ApplierError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config.clamped())
    }

    /// Write default configuration to `.applier/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".applier");
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ApplierError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    /// Reject configurations that cannot work at all
    pub fn validate(&self) -> Result<()> {
        if self.site.host.trim().is_empty() {
            return Err(ApplierError::Config("site.host must not be empty".into()));
        }
        if self.site.submit_selectors.is_empty() && self.site.submit_texts.is_empty() {
            return Err(ApplierError::Config(
                "site needs at least one submit selector or submit text".into(),
            ));
        }
        let api = Url::parse(&self.server.api_url).map_err(|e| {
            ApplierError::Config(format!("server.api_url '{}' is invalid: {}", self.server.api_url, e))
        })?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ApplierError::Config(format!(
                "server.api_url must be an http(s) URL, got '{}'",
                self.server.api_url
            )));
        }
        Ok(())
    }

    /// Raise timings below their floor, logging each adjustment
    pub fn clamped(mut self) -> Self {
        if self.transport.reconnect_delay_ms < MIN_RECONNECT_DELAY_MS {
            warn!(
                "transport.reconnect_delay_ms={} below floor, using {}",
                self.transport.reconnect_delay_ms, MIN_RECONNECT_DELAY_MS
            );
            self.transport.reconnect_delay_ms = MIN_RECONNECT_DELAY_MS;
        }
        if self.transport.login_poll_interval_ms < MIN_LOGIN_POLL_INTERVAL_MS {
            warn!(
                "transport.login_poll_interval_ms={} below floor, using {}",
                self.transport.login_poll_interval_ms, MIN_LOGIN_POLL_INTERVAL_MS
            );
            self.transport.login_poll_interval_ms = MIN_LOGIN_POLL_INTERVAL_MS;
        }
        if self.agent.max_navigations == 0 {
            warn!("agent.max_navigations=0 would fail every job off its page, using 1");
            self.agent.max_navigations = 1;
        }
        if self.dispatch.probe_attempts == 0 {
            warn!("dispatch.probe_attempts=0, using 1");
            self.dispatch.probe_attempts = 1;
        }
        if self.dispatch.probe_interval_ms < MIN_PROBE_INTERVAL_MS {
            warn!(
                "dispatch.probe_interval_ms={} below floor, using {}",
                self.dispatch.probe_interval_ms, MIN_PROBE_INTERVAL_MS
            );
            self.dispatch.probe_interval_ms = MIN_PROBE_INTERVAL_MS;
        }
        if self.transport.outbox_capacity == 0 {
            self.transport.outbox_capacity = 1;
        }
        self
    }

    /// WebSocket base derived from the API URL (`https` -> `wss`, `http` -> `ws`)
    pub fn ws_base_url(&self) -> String {
        let Ok(mut url) = Url::parse(&self.server.api_url) else {
            return self.server.api_url.trim_end_matches('/').to_string();
        };
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        if url.set_scheme(scheme).is_err() {
            return self.server.api_url.trim_end_matches('/').to_string();
        }
        url.set_query(None);
        url.set_fragment(None);
        url.as_str().trim_end_matches('/').to_string()
    }
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(MIN_RECONNECT_DELAY_MS))
    }

    pub fn login_poll_interval(&self) -> Duration {
        Duration::from_millis(self.login_poll_interval_ms.max(MIN_LOGIN_POLL_INTERVAL_MS))
    }
}

impl DispatchConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn ack_fallback(&self) -> Duration {
        Duration::from_millis(self.ack_fallback_ms)
    }
}

impl AgentConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn dynamic_content_delay(&self) -> Duration {
        Duration::from_millis(self.dynamic_content_delay_ms)
    }

    pub fn inter_job_delay(&self) -> Duration {
        Duration::from_millis(self.inter_job_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn success_timeout(&self) -> Duration {
        Duration::from_millis(self.success_timeout_ms)
    }
}

impl SiteConfig {
    /// Whether `url` belongs to the target site
    pub fn matches_url(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        let site = self.host.trim().to_ascii_lowercase();
        host == site || host.ends_with(&format!(".{}", site))
    }

    /// Path of `url` when it belongs to the target site
    pub fn site_path(&self, url: &str) -> Option<String> {
        if !self.matches_url(url) {
            return None;
        }
        Url::parse(url).ok().map(|parsed| parsed.path().to_string())
    }
}

impl BrowserConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            login_poll_interval_ms: default_login_poll_interval_ms(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            ack_fallback_ms: default_ack_fallback_ms(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            dynamic_content_delay_ms: default_dynamic_content_delay_ms(),
            inter_job_delay_ms: default_inter_job_delay_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            element_timeout_ms: default_element_timeout_ms(),
            success_timeout_ms: default_success_timeout_ms(),
            require_confirmation: false,
            max_navigations: default_max_navigations(),
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            home_url: default_home_url(),
            logged_in_paths: default_logged_in_paths(),
            login_path: default_login_path(),
            cover_letter_selectors: default_cover_letter_selectors(),
            submit_selectors: default_submit_selectors(),
            submit_texts: default_submit_texts(),
            login_indicators: default_login_indicators(),
            login_form_indicators: default_login_form_indicators(),
            success_indicators: default_success_indicators(),
            success_keywords: default_success_keywords(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            window_width: default_window_width(),
            window_height: default_window_height(),
            poll_interval_ms: default_poll_interval_ms(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
        }
    }
}
