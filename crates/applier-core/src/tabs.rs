//! Contract between the controller and whatever hosts page agents
//!
//! The controller never touches a page directly. It sees tabs, can open one,
//! and can send a request to the agent currently loaded in a tab. Terminal job
//! results travel the other way as [`AgentReport`]s on a channel handed to the
//! host at construction time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::{PageRequest, PageResponse};
use crate::types::{JobOutcome, TabId, TabInfo};
use crate::Result;

/// Browser-side tab management as seen from the controller
#[async_trait]
pub trait TabHost: Send + Sync {
    /// The tab the operator is currently looking at
    async fn active_tab(&self) -> Result<Option<TabInfo>>;

    /// Every tab currently showing the target site, in creation order
    async fn site_tabs(&self) -> Result<Vec<TabInfo>>;

    /// Open a new tab on `url` and make it active
    async fn create_tab(&self, url: &str) -> Result<TabInfo>;

    /// Deliver one request to the agent loaded in `tab` and wait for its reply.
    ///
    /// Fails with `AgentUnavailable` when no agent is loaded (page still
    /// loading, foreign site) and with `ContextDestroyed` when the page
    /// navigated away before replying.
    async fn send(&self, tab: &TabId, request: PageRequest) -> Result<PageResponse>;

    /// Drop pending page-scoped work (`jobQueue`, `jobData`) in every tab and
    /// stop whatever the agents are running, so nothing resumes on a later load
    async fn clear_page_state(&self) -> Result<()>;
}

/// Terminal job result emitted by a page agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub tab: TabId,
    pub outcome: JobOutcome,
}
