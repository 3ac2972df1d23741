//! Login state as seen from the controller
//!
//! The agent of the first target-site tab is asked for DOM evidence. When no
//! agent answers, the tab URL decides; with no target-site tab at all the
//! operator counts as logged out.

use applier_browser::SiteProfile;
use applier_core::{LoginState, PageRequest, PageResponse};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;

pub struct LoginMonitor {
    dispatcher: Arc<Dispatcher>,
    profile: Arc<SiteProfile>,
}

impl LoginMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, profile: Arc<SiteProfile>) -> Self {
        Self {
            dispatcher,
            profile,
        }
    }

    /// Current login state. Never fails; unreadable evidence means logged out.
    pub async fn check(&self) -> LoginState {
        let tabs = match self.dispatcher.tabs().site_tabs().await {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!("Could not list tabs for the login check: {}", e);
                return LoginState::LoggedOut;
            }
        };
        let Some(tab) = tabs.first() else {
            debug!("No target-site tab open, treating as logged out");
            return LoginState::LoggedOut;
        };

        match self
            .dispatcher
            .request(&tab.id, PageRequest::CheckLoginStatus)
            .await
        {
            Ok(PageResponse::LoginStatus { state }) if state != LoginState::Unknown => {
                debug!("Tab {} reports {}", tab.id, state);
                state
            }
            Ok(other) => {
                debug!("No usable login status from tab {} ({:?}), using URL", tab.id, other);
                self.profile.login_state_from_url(&tab.url)
            }
            Err(e) => {
                debug!("Agent in tab {} unreachable ({}), using URL", tab.id, e);
                self.profile.login_state_from_url(&tab.url)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use applier_core::{ApplierConfig, ApplierError, Result, TabHost, TabId, TabInfo};
    use async_trait::async_trait;

    struct StaticTabs {
        tabs: Vec<TabInfo>,
        reply: Option<LoginState>,
    }

    #[async_trait]
    impl TabHost for StaticTabs {
        async fn active_tab(&self) -> Result<Option<TabInfo>> {
            Ok(self.tabs.first().cloned())
        }

        async fn site_tabs(&self) -> Result<Vec<TabInfo>> {
            Ok(self.tabs.clone())
        }

        async fn create_tab(&self, url: &str) -> Result<TabInfo> {
            Err(ApplierError::Browser(format!("cannot open {}", url)))
        }

        async fn send(&self, tab: &TabId, _request: PageRequest) -> Result<PageResponse> {
            match self.reply {
                Some(state) => Ok(PageResponse::LoginStatus { state }),
                None => Err(ApplierError::AgentUnavailable(tab.to_string())),
            }
        }

        async fn clear_page_state(&self) -> Result<()> {
            Ok(())
        }
    }

    fn monitor(urls: &[&str], reply: Option<LoginState>) -> LoginMonitor {
        let config = ApplierConfig::default();
        let tabs = urls
            .iter()
            .enumerate()
            .map(|(i, url)| TabInfo {
                id: TabId::new(format!("tab-{}", i + 1)),
                url: url.to_string(),
                active: i == 0,
            })
            .collect();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(StaticTabs { tabs, reply }), &config));
        let profile = Arc::new(SiteProfile::from_config(&config.site).unwrap());
        LoginMonitor::new(dispatcher, profile)
    }

    #[tokio::test]
    async fn test_no_site_tab_is_logged_out() {
        assert_eq!(monitor(&[], None).check().await, LoginState::LoggedOut);
    }

    #[tokio::test]
    async fn test_dom_evidence_wins() {
        let monitor = monitor(
            &["https://www.upwork.com/nx/find-work/"],
            Some(LoginState::LoggedOut),
        );
        assert_eq!(monitor.check().await, LoginState::LoggedOut);
    }

    #[tokio::test]
    async fn test_url_fallback_when_agent_unreachable() {
        let on_site = monitor(&["https://www.upwork.com/nx/find-work/"], None);
        assert_eq!(on_site.check().await, LoginState::LoggedIn);

        let on_login = monitor(&["https://www.upwork.com/ab/account-security/login"], None);
        assert_eq!(on_login.check().await, LoginState::LoggedOut);
    }
}
