//! Scripted in-memory site
//!
//! A [`Page`] whose documents come from a route table. Navigation is
//! asynchronous like a real tab: the new document replaces the old one after
//! a load delay and bumps the load counter. Every action taken on the page is
//! recorded for assertions. A [`ScriptedSite`] opens tabs that share one
//! route table.

use applier_core::{same_location, ApplierError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::dom::{DomNode, DomSnapshot, NodeId, ReadyState};
use crate::page::{Page, PageFactory};

/// Document served for one route
#[derive(Debug, Clone, Default)]
pub struct ScriptedDocument {
    pub title: String,
    pub ready_state: ReadyState,
    pub nodes: Vec<DomNode>,
    /// Nodes appended when the keyed node is clicked
    pub reactions: Vec<(NodeId, Vec<DomNode>)>,
    /// Loading this route lands on another URL instead
    pub redirect: Option<String>,
}

impl ScriptedDocument {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ready_state: ReadyState::Complete,
            ..Self::default()
        }
    }

    pub fn with_node(mut self, node: DomNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn loading(mut self) -> Self {
        self.ready_state = ReadyState::Loading;
        self
    }

    /// A route that sends the browser on to `url`
    pub fn redirect_to(url: impl Into<String>) -> Self {
        Self {
            redirect: Some(url.into()),
            ..Self::new("Redirecting")
        }
    }

    /// Append `node` to the document when `clicked` is clicked
    pub fn on_click(mut self, clicked: u64, node: DomNode) -> Self {
        let clicked = NodeId(clicked);
        match self.reactions.iter_mut().find(|(id, _)| *id == clicked) {
            Some((_, nodes)) => nodes.push(node),
            None => self.reactions.push((clicked, vec![node])),
        }
        self
    }
}

/// Something done to a scripted page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    SetValue {
        url: String,
        node: NodeId,
        value: String,
    },
    Click {
        url: String,
        node: NodeId,
    },
    Navigate(String),
}

#[derive(Debug)]
struct Current {
    url: String,
    document: ScriptedDocument,
}

type Routes = Arc<Mutex<Vec<(String, ScriptedDocument)>>>;

const MAX_REDIRECTS: usize = 20;

#[derive(Debug)]
struct Shared {
    current: Mutex<Current>,
    routes: Routes,
    actions: Mutex<Vec<PageAction>>,
    mutations: watch::Sender<u64>,
    loads: watch::Sender<u64>,
    load_delay: Duration,
}

/// Scripted tab. Clones share the same tab.
#[derive(Debug, Clone)]
pub struct ScriptedPage {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn add_route(routes: &Routes, url: String, document: ScriptedDocument) {
    let mut routes = lock(routes);
    routes.retain(|(existing, _)| !same_location(existing, &url));
    routes.push((url, document));
}

impl Default for ScriptedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPage {
    /// Blank tab with a 50ms load delay
    pub fn new() -> Self {
        Self::with_load_delay(Duration::from_millis(50))
    }

    pub fn with_load_delay(load_delay: Duration) -> Self {
        Self::with_routes(Routes::default(), load_delay)
    }

    fn with_routes(routes: Routes, load_delay: Duration) -> Self {
        let (mutations, _) = watch::channel(0);
        let (loads, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                current: Mutex::new(Current {
                    url: "about:blank".to_string(),
                    document: ScriptedDocument::new(""),
                }),
                routes,
                actions: Mutex::new(Vec::new()),
                mutations,
                loads,
                load_delay,
            }),
        }
    }

    /// Serve `document` for `url`, replacing an earlier route
    pub fn route(&self, url: impl Into<String>, document: ScriptedDocument) -> &Self {
        add_route(&self.shared.routes, url.into(), document);
        self
    }

    /// Load `url` immediately, as if the user typed it
    pub fn open(&self, url: &str) {
        let mut url = url.to_string();
        let mut document = self.lookup(&url);
        // Follow redirects, bounded like a browser
        for _ in 0..MAX_REDIRECTS {
            match document.redirect.take() {
                Some(target) => {
                    document = self.lookup(&target);
                    url = target;
                }
                None => break,
            }
        }

        *lock(&self.shared.current) = Current { url, document };
        self.shared.loads.send_modify(|n| *n += 1);
        self.bump();
    }

    fn lookup(&self, url: &str) -> ScriptedDocument {
        lock(&self.shared.routes)
            .iter()
            .find(|(route, _)| same_location(route, url))
            .map(|(_, document)| document.clone())
            .unwrap_or_else(|| ScriptedDocument::new("Not Found"))
    }

    fn bump(&self) {
        self.shared.mutations.send_modify(|n| *n += 1);
    }

    /// Append a node to the current document
    pub fn add_node(&self, node: DomNode) {
        lock(&self.shared.current).document.nodes.push(node);
        self.bump();
    }

    /// Change a node of the current document in place
    pub fn update_node(&self, id: u64, change: impl FnOnce(&mut DomNode)) {
        {
            let mut current = lock(&self.shared.current);
            if let Some(node) = current.document.nodes.iter_mut().find(|n| n.id == NodeId(id)) {
                change(node);
            }
        }
        self.bump();
    }

    pub fn set_ready_state(&self, ready_state: ReadyState) {
        lock(&self.shared.current).document.ready_state = ready_state;
        self.bump();
    }

    pub fn url(&self) -> String {
        lock(&self.shared.current).url.clone()
    }

    pub fn value_of(&self, id: u64) -> Option<String> {
        lock(&self.shared.current)
            .document
            .nodes
            .iter()
            .find(|n| n.id == NodeId(id))
            .and_then(|n| n.value.clone())
    }

    pub fn actions(&self) -> Vec<PageAction> {
        lock(&self.shared.actions).clone()
    }

    pub fn clicks(&self) -> Vec<(String, NodeId)> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                PageAction::Click { url, node } => Some((url, node)),
                _ => None,
            })
            .collect()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                PageAction::Navigate(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    /// Documents loaded so far
    pub fn load_count(&self) -> u64 {
        *self.shared.loads.borrow()
    }

    /// Number of live mutation observers
    pub fn observer_count(&self) -> usize {
        self.shared.mutations.receiver_count()
    }

    fn record(&self, action: PageAction) {
        lock(&self.shared.actions).push(action);
    }

    fn attached(current: &Current, node: NodeId) -> Result<()> {
        if current.document.nodes.iter().any(|n| n.id == node) {
            Ok(())
        } else {
            Err(ApplierError::Browser(format!("Node {} is not attached", node)))
        }
    }
}

#[async_trait]
impl Page for ScriptedPage {
    async fn snapshot(&self) -> Result<DomSnapshot> {
        let current = lock(&self.shared.current);
        Ok(DomSnapshot {
            url: current.url.clone(),
            title: current.document.title.clone(),
            ready_state: current.document.ready_state,
            nodes: current.document.nodes.clone(),
        })
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url())
    }

    async fn set_value(&self, node: NodeId, value: &str) -> Result<()> {
        let url = {
            let mut current = lock(&self.shared.current);
            Self::attached(&current, node)?;
            if let Some(target) = current.document.nodes.iter_mut().find(|n| n.id == node) {
                target.value = Some(value.to_string());
            }
            current.url.clone()
        };
        self.record(PageAction::SetValue {
            url,
            node,
            value: value.to_string(),
        });
        self.bump();
        Ok(())
    }

    async fn click(&self, node: NodeId) -> Result<()> {
        let url = {
            let mut current = lock(&self.shared.current);
            Self::attached(&current, node)?;
            let revealed: Vec<DomNode> = current
                .document
                .reactions
                .iter()
                .filter(|(id, _)| *id == node)
                .flat_map(|(_, nodes)| nodes.iter().cloned())
                .collect();
            current.document.nodes.extend(revealed);
            current.url.clone()
        };
        self.record(PageAction::Click { url, node });
        self.bump();
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.record(PageAction::Navigate(url.to_string()));
        let page = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(page.shared.load_delay).await;
            page.open(&url);
        });
        Ok(())
    }

    fn mutations(&self) -> watch::Receiver<u64> {
        self.shared.mutations.subscribe()
    }

    fn loads(&self) -> watch::Receiver<u64> {
        self.shared.loads.subscribe()
    }
}

/// A scripted browser: every tab it opens serves the same routes
#[derive(Debug, Clone)]
pub struct ScriptedSite {
    routes: Routes,
    pages: Arc<Mutex<Vec<ScriptedPage>>>,
    load_delay: Duration,
}

impl Default for ScriptedSite {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSite {
    pub fn new() -> Self {
        Self::with_load_delay(Duration::from_millis(50))
    }

    pub fn with_load_delay(load_delay: Duration) -> Self {
        Self {
            routes: Routes::default(),
            pages: Arc::new(Mutex::new(Vec::new())),
            load_delay,
        }
    }

    pub fn route(&self, url: impl Into<String>, document: ScriptedDocument) -> &Self {
        add_route(&self.routes, url.into(), document);
        self
    }

    /// Open a tab on `url` without going through a host
    pub fn open(&self, url: &str) -> ScriptedPage {
        let page = ScriptedPage::with_routes(Arc::clone(&self.routes), self.load_delay);
        page.open(url);
        lock(&self.pages).push(page.clone());
        page
    }

    /// Tabs opened so far, in order
    pub fn pages(&self) -> Vec<ScriptedPage> {
        lock(&self.pages).clone()
    }
}

#[async_trait]
impl PageFactory for ScriptedSite {
    async fn open_page(&self, url: &str) -> Result<Arc<dyn Page>> {
        Ok(Arc::new(self.open(url)))
    }
}
