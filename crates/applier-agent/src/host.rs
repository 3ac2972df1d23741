//! In-process tab host
//!
//! Hosts page agents for tabs opened through a [`PageFactory`]. Each tab gets
//! a page-scoped store that outlives its documents, and a supervisor that
//! replaces the agent whenever a new document loads: the old agent's tasks
//! are aborted (dropping any pending reply slot) before the new agent starts.
//!
//! Replies go through a [`Responder`]. Deferred requests race the handler
//! against an acknowledgement timer; the host, not the handler, owns the
//! reply channel.

use applier_browser::{AutomationDriver, DriverTiming, Page, PageFactory, SiteProfile};
use applier_core::config::AgentConfig;
use applier_core::{
    AgentReport, ApplierConfig, ApplierError, DispatchAck, KeyValueStore, MemoryStore, PageRequest,
    PageResponse, Result, TabHost, TabId, TabInfo,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::agent::{AgentTasks, PageAgent};
use crate::responder::Responder;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything needed to build an agent for a fresh document
#[derive(Clone)]
struct AgentContext {
    profile: Arc<SiteProfile>,
    config: AgentConfig,
    reporter: mpsc::UnboundedSender<AgentReport>,
}

/// One hosted tab
struct HostedTab {
    id: TabId,
    page: Arc<dyn Page>,
    store: MemoryStore,
    agent: Mutex<Option<Arc<PageAgent>>>,
    supervisor: Mutex<Option<AbortHandle>>,
}

impl HostedTab {
    fn agent(&self) -> Option<Arc<PageAgent>> {
        lock(&self.agent).clone()
    }

    /// Tear down the current agent and load a new one for the current document
    async fn load_agent(&self, context: &AgentContext) {
        if let Some(previous) = lock(&self.agent).take() {
            previous.tasks().abort_all();
        }

        let url = match self.page.current_url().await {
            Ok(url) => url,
            Err(e) => {
                debug!("Tab {} has no readable location: {}", self.id, e);
                return;
            }
        };
        if !context.profile.is_site_url(&url) {
            debug!("Tab {} left the target site ({}), no agent", self.id, url);
            return;
        }

        let driver = AutomationDriver::new(
            Arc::clone(&self.page),
            Arc::clone(&context.profile),
            DriverTiming::from(&context.config),
        );
        let store: Arc<dyn KeyValueStore> = Arc::new(self.store.clone());
        let tasks = AgentTasks::new();
        let agent = PageAgent::new(
            self.id.clone(),
            driver,
            store,
            context.reporter.clone(),
            context.config.clone(),
            tasks.clone(),
        );
        *lock(&self.agent) = Some(Arc::clone(&agent));

        debug!("Agent loaded in tab {} on {}", self.id, url);
        tasks.spawn(agent.on_load());
    }

    /// Abort the agent, wipe the page-scoped store and start a fresh agent
    async fn reset(&self, context: &AgentContext) -> Result<()> {
        if let Some(agent) = lock(&self.agent).take() {
            agent.tasks().abort_all();
        }
        let pending = self.store.len().await;
        self.store.clear().await?;
        if pending > 0 {
            info!("Dropped {} page-scoped records in tab {}", pending, self.id);
        }
        self.load_agent(context).await;
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.abort();
        }
        if let Some(agent) = lock(&self.agent).take() {
            agent.tasks().abort_all();
        }
    }
}

/// [`TabHost`] running page agents in this process
pub struct InProcessTabs {
    factory: Arc<dyn PageFactory>,
    context: AgentContext,
    ack_fallback: Duration,
    tabs: Mutex<Vec<Arc<HostedTab>>>,
    active: Mutex<Option<TabId>>,
    next_id: AtomicU64,
}

impl InProcessTabs {
    pub fn new(
        factory: Arc<dyn PageFactory>,
        config: &ApplierConfig,
        reporter: mpsc::UnboundedSender<AgentReport>,
    ) -> Result<Self> {
        Ok(Self {
            factory,
            context: AgentContext {
                profile: Arc::new(SiteProfile::from_config(&config.site)?),
                config: config.agent.clone(),
                reporter,
            },
            ack_fallback: config.dispatch.ack_fallback(),
            tabs: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Start hosting an already open page and make it the active tab
    pub async fn attach(&self, page: Arc<dyn Page>) -> TabId {
        let id = TabId::new(format!("tab-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let hosted = Arc::new(HostedTab {
            id: id.clone(),
            page,
            store: MemoryStore::new(),
            agent: Mutex::new(None),
            supervisor: Mutex::new(None),
        });

        // Subscribe before the first load so no document is missed
        let mut loads = hosted.page.loads();
        hosted.load_agent(&self.context).await;

        let supervised = Arc::clone(&hosted);
        let context = self.context.clone();
        let supervisor = tokio::spawn(async move {
            while loads.changed().await.is_ok() {
                supervised.load_agent(&context).await;
            }
            debug!("Tab {} closed", supervised.id);
        })
        .abort_handle();
        *lock(&hosted.supervisor) = Some(supervisor);

        lock(&self.tabs).push(hosted);
        self.activate(&id);
        info!("Hosting tab {}", id);
        id
    }

    pub fn activate(&self, tab: &TabId) {
        *lock(&self.active) = Some(tab.clone());
    }

    /// Page-scoped store of `tab`
    pub fn store(&self, tab: &TabId) -> Result<MemoryStore> {
        Ok(self.find(tab)?.store.clone())
    }

    /// Whether an agent is currently loaded in `tab`
    pub fn has_agent(&self, tab: &TabId) -> bool {
        self.find(tab).map(|t| t.agent().is_some()).unwrap_or(false)
    }

    pub fn tab_count(&self) -> usize {
        lock(&self.tabs).len()
    }

    fn find(&self, tab: &TabId) -> Result<Arc<HostedTab>> {
        lock(&self.tabs)
            .iter()
            .find(|hosted| hosted.id == *tab)
            .cloned()
            .ok_or_else(|| ApplierError::TabNotFound(tab.to_string()))
    }

    async fn info(&self, hosted: &HostedTab, active: bool) -> Result<TabInfo> {
        Ok(TabInfo {
            id: hosted.id.clone(),
            url: hosted.page.current_url().await?,
            active,
        })
    }
}

impl Drop for InProcessTabs {
    fn drop(&mut self) {
        for hosted in lock(&self.tabs).iter() {
            hosted.shutdown();
        }
    }
}

#[async_trait]
impl TabHost for InProcessTabs {
    async fn active_tab(&self) -> Result<Option<TabInfo>> {
        let Some(active) = lock(&self.active).clone() else {
            return Ok(None);
        };
        match self.find(&active) {
            Ok(hosted) => Ok(Some(self.info(&hosted, true).await?)),
            Err(_) => Ok(None),
        }
    }

    async fn site_tabs(&self) -> Result<Vec<TabInfo>> {
        let active = lock(&self.active).clone();
        let tabs: Vec<Arc<HostedTab>> = lock(&self.tabs).clone();

        let mut found = Vec::new();
        for hosted in tabs {
            let info = self.info(&hosted, active.as_ref() == Some(&hosted.id)).await?;
            if self.context.profile.is_site_url(&info.url) {
                found.push(info);
            }
        }
        Ok(found)
    }

    async fn create_tab(&self, url: &str) -> Result<TabInfo> {
        let page = self.factory.open_page(url).await?;
        let id = self.attach(page).await;
        let hosted = self.find(&id)?;
        self.info(&hosted, true).await
    }

    async fn clear_page_state(&self) -> Result<()> {
        let tabs: Vec<Arc<HostedTab>> = lock(&self.tabs).clone();
        for hosted in tabs {
            hosted.reset(&self.context).await?;
        }
        Ok(())
    }

    async fn send(&self, tab: &TabId, request: PageRequest) -> Result<PageResponse> {
        let hosted = self.find(tab)?;
        let agent = hosted
            .agent()
            .ok_or_else(|| ApplierError::AgentUnavailable(format!("No agent loaded in tab {}", tab)))?;

        let action = request.action();
        let deferred = request.is_deferred();
        let (responder, reply) = Responder::channel(action);
        let responder = Arc::new(responder);

        let handler = Arc::clone(&agent);
        let answer = Arc::clone(&responder);
        agent.tasks().spawn(async move {
            let response = handler.handle(request).await;
            answer.respond(response);
        });

        if deferred {
            let fallback = self.ack_fallback;
            let answer = Arc::clone(&responder);
            agent.tasks().spawn(async move {
                tokio::time::sleep(fallback).await;
                if answer.respond(PageResponse::accepted(DispatchAck::Initiated, "Processing initiated")) {
                    debug!("Acknowledged '{}' before the handler finished", action);
                }
            });
        }
        drop(responder);

        reply.await.map_err(|_| {
            ApplierError::ContextDestroyed(format!("Tab {} navigated before answering '{}'", tab, action))
        })
    }
}
