//! Core type definitions for Applier

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Default wait after clicking submit, before a job is declared complete
pub const DEFAULT_POST_SUBMIT_DELAY_MS: u64 = 3000;

/// One proposal-submission task pushed by the remote job source.
///
/// Field names follow the wire format. Aliases accept the payload shape used
/// by older job sources (`coverLetter`, `screeningResponses`, `delayAfterApply`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub job_id: String,
    pub job_url: String,
    #[serde(default, alias = "coverLetter", skip_serializing_if = "Option::is_none")]
    pub cover_letter_text: Option<String>,
    #[serde(default, alias = "screeningResponses")]
    pub screening_answers: BTreeMap<String, String>,
    #[serde(default)]
    pub timing: JobTiming,
}

/// Per-job timing preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTiming {
    #[serde(default = "default_post_submit_delay_ms", alias = "delayAfterApply")]
    pub post_submit_delay_ms: u64,
}

fn default_post_submit_delay_ms() -> u64 {
    DEFAULT_POST_SUBMIT_DELAY_MS
}

impl Default for JobTiming {
    fn default() -> Self {
        Self {
            post_submit_delay_ms: default_post_submit_delay_ms(),
        }
    }
}

impl JobTiming {
    pub fn post_submit_delay(&self) -> Duration {
        Duration::from_millis(self.post_submit_delay_ms)
    }
}

impl JobDescriptor {
    pub fn new(job_id: impl Into<String>, job_url: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_url: job_url.into(),
            cover_letter_text: None,
            screening_answers: BTreeMap::new(),
            timing: JobTiming::default(),
        }
    }

    pub fn with_cover_letter(mut self, text: impl Into<String>) -> Self {
        self.cover_letter_text = Some(text.into());
        self
    }

    pub fn with_answer(mut self, question_id: impl Into<String>, answer: impl Into<String>) -> Self {
        self.screening_answers
            .insert(question_id.into(), answer.into());
        self
    }

    pub fn with_post_submit_delay_ms(mut self, delay_ms: u64) -> Self {
        self.timing.post_submit_delay_ms = delay_ms;
        self
    }

    /// Cover letter text, if the job carries a non-blank one
    pub fn cover_letter(&self) -> Option<&str> {
        self.cover_letter_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }

    /// Whether `location` already shows this job's page
    pub fn is_at(&self, location: &str) -> bool {
        same_location(&self.job_url, location)
    }
}

/// Compare two page locations, ignoring fragments and trailing slashes.
///
/// Both sides are parsed, so host case, default ports and userinfo do not
/// matter. Unparseable input falls back to comparing the raw text.
pub fn same_location(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str() == b.host_str()
                && a.port_or_known_default() == b.port_or_known_default()
                && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
                && a.query() == b.query()
        }
        _ => {
            fn normalize(url: &str) -> &str {
                let url = url.split('#').next().unwrap_or(url);
                url.trim_end_matches('/')
            }
            normalize(a) == normalize(b)
        }
    }
}

/// One logical operator engagement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub connected: bool,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            connected: false,
        }
    }
}

/// Login state derived from page evidence on every poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    #[default]
    Unknown,
    LoggedIn,
    LoggedOut,
}

impl LoginState {
    pub fn is_logged_in(&self) -> bool {
        matches!(self, Self::LoggedIn)
    }

    pub fn from_bool(logged_in: bool) -> Self {
        if logged_in {
            Self::LoggedIn
        } else {
            Self::LoggedOut
        }
    }
}

impl std::fmt::Display for LoginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::LoggedIn => write!(f, "logged_in"),
            Self::LoggedOut => write!(f, "logged_out"),
        }
    }
}

/// State of the controller's streaming connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Short indicator text shown on the control surface badge
    pub fn badge(&self) -> &'static str {
        match self {
            Self::Disconnected => "OFF",
            Self::Connecting => "...",
            Self::Connected => "ON",
            Self::Error => "ERR",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Terminal result of processing one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        job_id: String,
        success: bool,
        message: String,
    },
    Failed {
        job_id: String,
        error: String,
    },
}

impl JobOutcome {
    pub fn completed(job_id: impl Into<String>, success: bool, message: impl Into<String>) -> Self {
        Self::Completed {
            job_id: job_id.into(),
            success,
            message: message.into(),
        }
    }

    pub fn failed(job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Failed {
            job_id: job_id.into(),
            error: error.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { success: true, .. })
    }
}

/// Identifier of a browser tab hosting (or about to host) a page agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub String);

impl TabId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a tab as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_descriptor_wire_format() {
        let json = r#"{
            "jobId": "j1",
            "jobUrl": "https://site/x",
            "coverLetterText": "Hello",
            "screeningAnswers": {"q1": "Yes"},
            "timing": {"postSubmitDelayMs": 1500}
        }"#;
        let job: JobDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(job.job_id, "j1");
        assert_eq!(job.cover_letter(), Some("Hello"));
        assert_eq!(job.screening_answers.get("q1").map(String::as_str), Some("Yes"));
        assert_eq!(job.timing.post_submit_delay_ms, 1500);
    }

    #[test]
    fn test_job_descriptor_legacy_aliases() {
        let json = r#"{
            "jobId": "j2",
            "jobUrl": "https://site/y",
            "coverLetter": "Hi there",
            "screeningResponses": {"q": "No"},
            "timing": {"delayAfterApply": 500}
        }"#;
        let job: JobDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(job.cover_letter(), Some("Hi there"));
        assert_eq!(job.screening_answers.len(), 1);
        assert_eq!(job.timing.post_submit_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_job_descriptor_defaults() {
        let job: JobDescriptor =
            serde_json::from_str(r#"{"jobId": "j3", "jobUrl": "https://site/z"}"#).unwrap();
        assert_eq!(job.cover_letter(), None);
        assert!(job.screening_answers.is_empty());
        assert_eq!(job.timing.post_submit_delay_ms, DEFAULT_POST_SUBMIT_DELAY_MS);
    }

    #[test]
    fn test_blank_cover_letter_is_absent() {
        let job = JobDescriptor::new("j", "https://site/x").with_cover_letter("   ");
        assert_eq!(job.cover_letter(), None);
    }

    #[test]
    fn test_same_location() {
        assert!(same_location("https://www.site.com", "https://www.site.com/"));
        assert!(same_location("https://site/x#apply", "https://site/x"));
        assert!(!same_location("https://site/x", "https://site/y"));
        assert!(!same_location("https://site/x?a=1", "https://site/x"));
    }

    #[test]
    fn test_same_location_normalises_host_and_port() {
        assert!(same_location("https://WWW.Site.com/jobs/~a", "https://www.site.com/jobs/~a"));
        assert!(same_location("https://www.site.com:443/jobs/~a/", "https://www.site.com/jobs/~a"));
        assert!(same_location("https://me@www.site.com/x", "https://www.site.com/x"));
        assert!(!same_location("http://www.site.com/x", "https://www.site.com/x"));
        assert!(!same_location("https://www.site.com:8443/x", "https://www.site.com/x"));
        assert!(!same_location("https://www.site.com/Jobs", "https://www.site.com/jobs"));
    }

    #[test]
    fn test_connection_state_badge() {
        assert_eq!(ConnectionState::Connected.badge(), "ON");
        assert_eq!(ConnectionState::Disconnected.badge(), "OFF");
        assert_eq!(ConnectionState::Error.badge(), "ERR");
        assert!(!ConnectionState::Connecting.is_connected());
    }

    #[test]
    fn test_job_outcome_accessors() {
        let done = JobOutcome::completed("a", true, "ok");
        let failed = JobOutcome::failed("b", "Apply button not found");
        assert_eq!(done.job_id(), "a");
        assert_eq!(failed.job_id(), "b");
        assert!(done.is_success());
        assert!(!failed.is_success());
    }
}
