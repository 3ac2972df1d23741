//! The live document an automation driver operates on

use applier_core::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::dom::{DomSnapshot, NodeId};

/// One browser tab's current document.
///
/// Implementations must bump the [`mutations`](Page::mutations) counter on
/// every DOM change and the [`loads`](Page::loads) counter each time a new
/// document has loaded. Dropping a receiver detaches that observer.
#[async_trait]
pub trait Page: Send + Sync {
    /// Read the whole document
    async fn snapshot(&self) -> Result<DomSnapshot>;

    async fn current_url(&self) -> Result<String>;

    /// Set a form control's value and fire `input` and `change` on it
    async fn set_value(&self, node: NodeId, value: &str) -> Result<()>;

    async fn click(&self, node: NodeId) -> Result<()>;

    /// Start navigating to `url` and return without waiting.
    ///
    /// Anything running against the current document is torn down once the
    /// new one loads.
    async fn navigate(&self, url: &str) -> Result<()>;

    fn mutations(&self) -> watch::Receiver<u64>;

    fn loads(&self) -> watch::Receiver<u64>;
}

/// Opens new tabs
#[async_trait]
pub trait PageFactory: Send + Sync {
    /// Open a tab on `url`; the returned page has started loading it
    async fn open_page(&self, url: &str) -> Result<Arc<dyn Page>>;
}
