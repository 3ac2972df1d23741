//! Page automation driver
//!
//! Higher-level operations on top of [`Page`]: readiness and element waits
//! driven by mutation notifications, form filling, submission, success
//! verification and login detection. All markup knowledge comes from a
//! [`SiteProfile`] compiled from configuration.

use applier_core::config::{AgentConfig, SiteConfig};
use applier_core::{ApplierError, LoginState, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dom::{DomNode, DomSnapshot, NodeId};
use crate::page::Page;
use crate::selector::{Locator, LocatorChain};

/// Tags that may hold a screening answer
const ANSWER_TAGS: [&str; 3] = ["textarea", "input", "select"];

/// Tags eligible for the text-based submit fallback
const BUTTON_TAGS: [&str; 2] = ["button", "input"];

/// Site markup knowledge with every selector parsed up front
#[derive(Debug, Clone)]
pub struct SiteProfile {
    site: SiteConfig,
    pub cover_letter: LocatorChain,
    pub submit: LocatorChain,
    pub login_indicators: LocatorChain,
    pub login_form: LocatorChain,
    pub success_indicators: LocatorChain,
}

impl SiteProfile {
    pub fn from_config(site: &SiteConfig) -> Result<Self> {
        let cover_letter = LocatorChain::from_selectors("cover_letter", &site.cover_letter_selectors)?
            .with(Locator::css("textarea")?);

        let mut submit = LocatorChain::from_selectors("submit", &site.submit_selectors)?;
        if !site.submit_texts.is_empty() {
            submit = submit.with(Locator::text(BUTTON_TAGS, &site.submit_texts));
        }

        Ok(Self {
            site: site.clone(),
            cover_letter,
            submit,
            login_indicators: LocatorChain::from_selectors("login_indicator", &site.login_indicators)?,
            login_form: LocatorChain::from_selectors("login_form", &site.login_form_indicators)?,
            success_indicators: LocatorChain::from_selectors(
                "success_indicator",
                &site.success_indicators,
            )?,
        })
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    pub fn is_site_url(&self, url: &str) -> bool {
        self.site.matches_url(url)
    }

    /// Whether `url` is a page only reachable when logged in
    pub fn is_logged_in_url(&self, url: &str) -> bool {
        self.site.site_path(url).is_some_and(|path| {
            self.site
                .logged_in_paths
                .iter()
                .any(|p| path.contains(p.as_str()))
        })
    }

    /// Login guess from a tab URL alone, used when no agent answers.
    ///
    /// Any site page other than the login page counts as logged in.
    pub fn login_state_from_url(&self, url: &str) -> LoginState {
        match self.site.site_path(url) {
            Some(path) if !path.contains(self.site.login_path.as_str()) => LoginState::LoggedIn,
            _ => LoginState::LoggedOut,
        }
    }

    /// Login state from page evidence.
    ///
    /// A visible account indicator wins, then a login form, then the URL.
    pub fn login_state_from_snapshot(&self, snapshot: &DomSnapshot) -> LoginState {
        if let Some(node) = self.login_indicators.resolve(snapshot) {
            debug!("Login indicator found: <{}> {}", node.tag, node.id);
            return LoginState::LoggedIn;
        }
        if self.login_form.resolve(snapshot).is_some() {
            return LoginState::LoggedOut;
        }
        LoginState::from_bool(self.is_logged_in_url(&snapshot.url))
    }

    /// Visible confirmation element carrying a success keyword
    pub fn find_success<'a>(&self, snapshot: &'a DomSnapshot) -> Option<&'a DomNode> {
        let keywords = &self.site.success_keywords;
        self.success_indicators.resolve_where(snapshot, |node| {
            let label = node.label().to_lowercase();
            keywords.iter().any(|k| label.contains(&k.to_lowercase()))
        })
    }
}

/// Outcome of filling screening answers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreeningReport {
    pub filled: usize,
    /// Question ids with no matching visible field
    pub unmatched: Vec<String>,
}

/// Identity of the current document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub url: String,
    pub title: String,
    pub is_target_site: bool,
}

/// Driver timing, taken from [`AgentConfig`]
#[derive(Debug, Clone, Copy)]
pub struct DriverTiming {
    pub ready_timeout: Duration,
    pub element_timeout: Duration,
}

impl From<&AgentConfig> for DriverTiming {
    fn from(config: &AgentConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout(),
            element_timeout: config.element_timeout(),
        }
    }
}

/// Automation operations for one page
#[derive(Clone)]
pub struct AutomationDriver {
    page: Arc<dyn Page>,
    profile: Arc<SiteProfile>,
    timing: DriverTiming,
}

impl AutomationDriver {
    pub fn new(page: Arc<dyn Page>, profile: Arc<SiteProfile>, timing: DriverTiming) -> Self {
        Self {
            page,
            profile,
            timing,
        }
    }

    pub fn page(&self) -> &Arc<dyn Page> {
        &self.page
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    /// Evaluate `probe` now and after every DOM mutation until it yields or
    /// `timeout` elapses (`Ok(None)`).
    ///
    /// The mutation observer is released on every exit path.
    pub async fn wait_until<T, F>(&self, timeout: Duration, mut probe: F) -> Result<Option<T>>
    where
        F: FnMut(&DomSnapshot) -> Option<T>,
    {
        let mut mutations = self.page.mutations();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let snapshot = self.page.snapshot().await?;
            if let Some(found) = probe(&snapshot) {
                return Ok(Some(found));
            }

            match tokio::time::timeout_at(deadline, mutations.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ApplierError::Browser("Page closed while waiting".into())),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Wait for `document.readyState == "complete"`
    pub async fn wait_until_ready(&self) -> Result<()> {
        let ready = self
            .wait_until(self.timing.ready_timeout, |snapshot| {
                snapshot.is_complete().then_some(())
            })
            .await?;
        ready.ok_or_else(|| {
            ApplierError::Automation(format!(
                "Page did not finish loading within {:?}",
                self.timing.ready_timeout
            ))
        })
    }

    /// Wait for `chain` to resolve to a visible element
    pub async fn wait_for(&self, chain: &LocatorChain, timeout: Duration) -> Result<NodeId> {
        self.find(chain, timeout).await?.ok_or_else(|| {
            ApplierError::Automation(format!("Timed out after {:?} waiting for {}", timeout, chain.name()))
        })
    }

    async fn find(&self, chain: &LocatorChain, timeout: Duration) -> Result<Option<NodeId>> {
        self.wait_until(timeout, |snapshot| chain.resolve(snapshot).map(|node| node.id))
            .await
    }

    pub async fn fill_cover_letter(&self, text: &str) -> Result<NodeId> {
        let node = self
            .find(&self.profile.cover_letter, self.timing.element_timeout)
            .await?
            .ok_or_else(|| ApplierError::Automation("Cover letter textarea not found".into()))?;

        self.page.set_value(node, text).await?;
        debug!("Filled cover letter into {}", node);
        Ok(node)
    }

    /// Fill each answer into the field keyed by question id, best effort.
    ///
    /// A field matches by `name`, then `data-question-id`, then `id`.
    pub async fn fill_screening_answers(
        &self,
        answers: &BTreeMap<String, String>,
    ) -> Result<ScreeningReport> {
        let mut report = ScreeningReport::default();
        if answers.is_empty() {
            return Ok(report);
        }

        let snapshot = self.page.snapshot().await?;
        for (question_id, answer) in answers {
            match answer_field(&snapshot, question_id) {
                Some(node) => {
                    self.page.set_value(node, answer).await?;
                    report.filled += 1;
                }
                None => {
                    warn!("No field for screening question '{}'", question_id);
                    report.unmatched.push(question_id.clone());
                }
            }
        }
        Ok(report)
    }

    pub async fn submit(&self) -> Result<NodeId> {
        let node = self
            .find(&self.profile.submit, self.timing.element_timeout)
            .await?
            .ok_or_else(|| ApplierError::Automation("Apply button not found".into()))?;

        info!("Clicking submit button {}", node);
        self.page.click(node).await?;
        Ok(node)
    }

    /// Whether a success indicator shows up within `timeout`
    pub async fn verify_success(&self, timeout: Duration) -> bool {
        let profile = &self.profile;
        match self
            .wait_until(timeout, |snapshot| profile.find_success(snapshot).map(|n| n.id))
            .await
        {
            Ok(Some(node)) => {
                debug!("Success indicator {} observed", node);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Success verification aborted: {}", e);
                false
            }
        }
    }

    pub async fn detect_login(&self) -> Result<LoginState> {
        let snapshot = self.page.snapshot().await?;
        Ok(self.profile.login_state_from_snapshot(&snapshot))
    }

    pub async fn page_info(&self) -> Result<PageInfo> {
        let snapshot = self.page.snapshot().await?;
        Ok(PageInfo {
            is_target_site: self.profile.is_site_url(&snapshot.url),
            url: snapshot.url,
            title: snapshot.title,
        })
    }
}

fn answer_field(snapshot: &DomSnapshot, question_id: &str) -> Option<NodeId> {
    ["name", "data-question-id", "id"].iter().find_map(|attr| {
        snapshot
            .nodes
            .iter()
            .find(|node| {
                node.visible
                    && ANSWER_TAGS.contains(&node.tag.as_str())
                    && node.attr(attr) == Some(question_id)
            })
            .map(|node| node.id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::ReadyState;
    use crate::scripted::{ScriptedDocument, ScriptedPage};

    fn profile() -> SiteProfile {
        SiteProfile::from_config(&SiteConfig::default()).unwrap()
    }

    #[test]
    fn test_login_state_from_url() {
        let profile = profile();
        assert_eq!(
            profile.login_state_from_url("https://www.upwork.com/nx/find-work/"),
            LoginState::LoggedIn
        );
        assert_eq!(
            profile.login_state_from_url("https://www.upwork.com/ab/account-security/login"),
            LoginState::LoggedOut
        );
        assert_eq!(
            profile.login_state_from_url("https://example.com/"),
            LoginState::LoggedOut
        );
    }

    #[test]
    fn test_url_heuristics_only_look_at_the_path() {
        let profile = profile();
        assert_eq!(
            profile.login_state_from_url("https://www.upwork.com/jobs/~a?return=/login"),
            LoginState::LoggedIn
        );
        assert_eq!(
            profile.login_state_from_url("https://WWW.UPWORK.COM/nx/find-work/"),
            LoginState::LoggedIn
        );
        assert!(!profile.is_logged_in_url("https://www.upwork.com/?next=/nx/"));
        assert!(profile.is_logged_in_url("https://me:pw@www.upwork.com/nx/find-work/"));
        assert!(!profile.is_logged_in_url("https://example.com/nx/"));
    }

    #[test]
    fn test_login_state_from_snapshot() {
        let profile = profile();

        let dashboard = DomSnapshot::new("https://www.upwork.com/")
            .with_node(DomNode::element(1, "div").with_attr("data-test", "user-menu"));
        assert_eq!(profile.login_state_from_snapshot(&dashboard), LoginState::LoggedIn);

        let login = DomSnapshot::new("https://www.upwork.com/ab/account-security/login")
            .with_node(DomNode::element(1, "input").with_attr("name", "username"));
        assert_eq!(profile.login_state_from_snapshot(&login), LoginState::LoggedOut);

        let bare = DomSnapshot::new("https://www.upwork.com/jobs/~01");
        assert_eq!(profile.login_state_from_snapshot(&bare), LoginState::LoggedIn);

        let hidden = DomSnapshot::new("https://www.upwork.com/")
            .with_node(DomNode::element(1, "div").with_attr("class", "user-menu").hidden());
        assert_eq!(profile.login_state_from_snapshot(&hidden), LoginState::LoggedOut);
    }

    #[test]
    fn test_find_success_requires_keyword() {
        let profile = profile();
        let snapshot = DomSnapshot::new("https://www.upwork.com/")
            .with_node(DomNode::element(1, "div").with_attr("class", "alert-success").with_text("Saved"));
        assert!(profile.find_success(&snapshot).is_none());

        let snapshot = snapshot.with_node(
            DomNode::element(2, "div")
                .with_attr("class", "success-message")
                .with_text("Your proposal was Submitted"),
        );
        assert_eq!(profile.find_success(&snapshot).map(|n| n.id), Some(NodeId(2)));
    }

    #[test]
    fn test_answer_field_lookup_order() {
        let snapshot = DomSnapshot::new("https://site/x")
            .with_node(DomNode::element(1, "input").with_attr("id", "q1"))
            .with_node(DomNode::element(2, "textarea").with_attr("name", "q1"))
            .with_node(DomNode::element(3, "div").with_attr("name", "q2"))
            .with_node(DomNode::element(4, "select").with_attr("data-question-id", "q3"));

        assert_eq!(answer_field(&snapshot, "q1"), Some(NodeId(2)));
        assert_eq!(answer_field(&snapshot, "q2"), None);
        assert_eq!(answer_field(&snapshot, "q3"), Some(NodeId(4)));
    }

    fn driver(page: &ScriptedPage) -> AutomationDriver {
        let page: Arc<dyn Page> = Arc::new(page.clone());
        AutomationDriver::new(
            page,
            Arc::new(profile()),
            DriverTiming {
                ready_timeout: Duration::from_secs(30),
                element_timeout: Duration::from_secs(5),
            },
        )
    }

    const JOB: &str = "https://www.upwork.com/jobs/~01";

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_sees_late_element() {
        let page = ScriptedPage::new();
        page.route(JOB, ScriptedDocument::new("Job"));
        page.open(JOB);
        let driver = driver(&page);

        let late = page.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            late.add_node(DomNode::element(5, "button").with_attr("data-test", "submit-btn"));
        });

        let node = driver.submit().await.unwrap();
        assert_eq!(node, NodeId(5));
        assert_eq!(page.clicks(), vec![(JOB.to_string(), NodeId(5))]);
        assert_eq!(page.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_submit_times_out() {
        let page = ScriptedPage::new();
        page.route(JOB, ScriptedDocument::new("Job"));
        page.open(JOB);

        let started = tokio::time::Instant::now();
        let err = driver(&page).submit().await.unwrap_err();
        assert_eq!(err.to_string(), "Apply button not found");
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(page.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_errors_on_timeout() {
        let page = ScriptedPage::new();
        page.open(JOB);
        let driver = driver(&page);

        let chain = driver.profile().login_indicators.clone();
        let err = driver.wait_for(&chain, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ApplierError::Automation(ref m) if m.contains("login_indicator")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready() {
        let page = ScriptedPage::new();
        page.route(JOB, ScriptedDocument::new("Job").loading());
        page.open(JOB);

        let loader = page.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            loader.set_ready_state(ReadyState::Complete);
        });
        driver(&page).wait_until_ready().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_form_and_verify() {
        let page = ScriptedPage::new();
        page.route(
            JOB,
            ScriptedDocument::new("Job")
                .with_node(DomNode::element(1, "textarea").with_attr("name", "coverLetter"))
                .with_node(DomNode::element(2, "input").with_attr("name", "q1"))
                .with_node(DomNode::element(3, "button").with_text("Submit proposal"))
                .on_click(
                    3,
                    DomNode::element(4, "div")
                        .with_attr("class", "alert-success")
                        .with_text("Proposal submitted"),
                ),
        );
        page.open(JOB);
        let driver = driver(&page);

        driver.fill_cover_letter("Hello").await.unwrap();
        let answers = BTreeMap::from([
            ("q1".to_string(), "Yes".to_string()),
            ("q9".to_string(), "No".to_string()),
        ]);
        let report = driver.fill_screening_answers(&answers).await.unwrap();
        assert_eq!(report.filled, 1);
        assert_eq!(report.unmatched, vec!["q9".to_string()]);

        assert!(!driver.verify_success(Duration::from_millis(10)).await);
        assert_eq!(driver.submit().await.unwrap(), NodeId(3));
        assert!(driver.verify_success(Duration::from_secs(1)).await);

        assert_eq!(page.value_of(1).as_deref(), Some("Hello"));
        assert_eq!(page.value_of(2).as_deref(), Some("Yes"));
    }

    #[tokio::test]
    async fn test_page_info() {
        let page = ScriptedPage::new();
        page.route(JOB, ScriptedDocument::new("Job title"));
        page.open(JOB);

        let info = driver(&page).page_info().await.unwrap();
        assert_eq!(info.title, "Job title");
        assert!(info.is_target_site);
        assert_eq!(driver(&page).detect_login().await.unwrap(), LoginState::LoggedIn);
    }

    #[test]
    fn test_cover_letter_falls_back_to_any_textarea() {
        let profile = profile();
        let snapshot = DomSnapshot::new("https://site/x")
            .with_node(DomNode::element(1, "textarea").with_attr("name", "notes"));
        assert_eq!(profile.cover_letter.resolve(&snapshot).map(|n| n.id), Some(NodeId(1)));
    }
}
