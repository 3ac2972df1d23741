//! Cross-context dispatch from the controller to page agents
//!
//! A freshly loaded page may not have its agent yet, so work is only handed
//! over after a liveness probe succeeds. The probe budget is strict: exactly
//! `probe_attempts` pings, `probe_interval` apart, then `DispatchTimeout`.

use applier_core::config::SiteConfig;
use applier_core::{
    ApplierConfig, ApplierError, DispatchAck, PageRequest, PageResponse, Result, TabHost, TabId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reason reported upstream when no page agent answers the probe
pub const AGENT_NOT_LOADED: &str = "Content script failed to load";

/// Upstream error text for a failed job dispatch
pub fn failure_reason(err: &ApplierError) -> String {
    match err {
        ApplierError::DispatchTimeout { .. } => AGENT_NOT_LOADED.to_string(),
        other => other.to_string(),
    }
}

/// Routes requests from the controller to the page agent of a tab
pub struct Dispatcher {
    tabs: Arc<dyn TabHost>,
    site: SiteConfig,
    probe_attempts: u32,
    probe_interval: Duration,
    response_timeout: Duration,
}

impl Dispatcher {
    pub fn new(tabs: Arc<dyn TabHost>, config: &ApplierConfig) -> Self {
        Self {
            tabs,
            site: config.site.clone(),
            probe_attempts: config.dispatch.probe_attempts.max(1),
            probe_interval: config.dispatch.probe_interval(),
            response_timeout: config.dispatch.response_timeout(),
        }
    }

    pub fn tabs(&self) -> &Arc<dyn TabHost> {
        &self.tabs
    }

    /// Send one request and wait at most the response timeout for its reply
    pub async fn request(&self, tab: &TabId, request: PageRequest) -> Result<PageResponse> {
        let action = request.action();
        match tokio::time::timeout(self.response_timeout, self.tabs.send(tab, request)).await {
            Ok(reply) => reply,
            Err(_) => Err(ApplierError::RequestTimeout(format!(
                "'{}' on tab {} unanswered after {:?}",
                action, tab, self.response_timeout
            ))),
        }
    }

    /// Ping the agent of `tab` until it answers or the probe budget runs out
    pub async fn probe(&self, tab: &TabId) -> Result<()> {
        for attempt in 1..=self.probe_attempts {
            match self.request(tab, PageRequest::Ping).await {
                Ok(PageResponse::Pong) => {
                    debug!("Agent in tab {} answered probe {}", tab, attempt);
                    return Ok(());
                }
                Ok(other) => debug!("Unexpected probe reply from tab {}: {:?}", tab, other),
                Err(e) => debug!(
                    "Probe {}/{} of tab {} failed: {}",
                    attempt, self.probe_attempts, tab, e
                ),
            }

            if attempt < self.probe_attempts {
                tokio::time::sleep(self.probe_interval).await;
            }
        }

        warn!("No agent answered in tab {} after {} probes", tab, self.probe_attempts);
        Err(ApplierError::DispatchTimeout {
            attempts: self.probe_attempts,
        })
    }

    /// The active tab when it shows the target site, otherwise a new tab on
    /// the site's home page
    pub async fn ensure_tab(&self) -> Result<TabId> {
        match self.tabs.active_tab().await? {
            Some(tab) if self.site.matches_url(&tab.url) => {
                debug!("Using active tab {} on {}", tab.id, tab.url);
                Ok(tab.id)
            }
            _ => {
                info!("No tab on {}, opening {}", self.site.host, self.site.home_url);
                let tab = self.tabs.create_tab(&self.site.home_url).await?;
                Ok(tab.id)
            }
        }
    }

    /// Probe `tab`, then deliver `request`. Error replies become errors.
    pub async fn dispatch(&self, tab: &TabId, request: PageRequest) -> Result<PageResponse> {
        self.probe(tab).await?;
        self.request(tab, request).await?.into_result()
    }

    /// Hand a job or job queue to a page agent on the target site.
    ///
    /// When the agent received the jobs but its reply was lost, the request is
    /// delivered once more to the same tab; agents ignore jobs already pending.
    /// If that does not settle it either, `DeliveryUnconfirmed` is returned and
    /// the jobs are left to the page's persisted queue.
    pub async fn dispatch_jobs(&self, request: PageRequest) -> Result<DispatchAck> {
        let tab = self.ensure_tab().await?;

        match self.deliver_jobs(&tab, request.clone()).await {
            Err(e) if e.reply_lost() => {
                warn!("Reply from tab {} lost ({}), delivering again", tab, e);
                self.deliver_jobs(&tab, request).await.map_err(|retry| {
                    ApplierError::DeliveryUnconfirmed(format!(
                        "tab {}: {}, then {}",
                        tab, e, retry
                    ))
                })
            }
            other => other,
        }
    }

    async fn deliver_jobs(&self, tab: &TabId, request: PageRequest) -> Result<DispatchAck> {
        let action = request.action();
        match self.dispatch(tab, request).await? {
            PageResponse::Accepted { ack, message } => {
                info!("Tab {} accepted '{}': {:?} ({})", tab, action, ack, message);
                Ok(ack)
            }
            other => Err(ApplierError::Other(format!(
                "Unexpected reply to '{}': {:?}",
                action, other
            ))),
        }
    }
}
