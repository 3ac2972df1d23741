//! In-process links for tests
//!
//! [`ChannelConnector`] hands every accepted link to the test as a
//! [`RemoteEnd`], which plays the job source.

use crate::transport::{Connector, Link, LinkEvent};
use applier_core::{ApplierError, ClientMessage, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Job-source side of a link opened through [`ChannelConnector`]
#[derive(Debug)]
pub struct RemoteEnd {
    url: String,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl RemoteEnd {
    /// URL the client connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a text frame to the client
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Text(frame.into())).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send(value.to_string())
    }

    /// Report a read error to the client, as a broken socket would
    pub fn fail(&self, error: impl Into<String>) {
        let _ = self.to_client.send(LinkEvent::Error(error.into()));
    }

    /// Close the link from the job-source side
    pub fn close(&self) {
        let _ = self.to_client.send(LinkEvent::Closed);
    }

    /// Next message the client sent; `None` once the client hung up
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        while let Some(frame) = self.from_client.recv().await {
            match serde_json::from_str(&frame) {
                Ok(message) => return Some(message),
                Err(e) => warn!("Remote end got an unparsable frame: {}", e),
            }
        }
        None
    }

    /// Message already sent by the client, without waiting
    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        let frame = self.from_client.try_recv().ok()?;
        serde_json::from_str(&frame).ok()
    }
}

/// In-process [`Connector`]: every accepted link shows up as a [`RemoteEnd`]
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    accepted: mpsc::UnboundedSender<RemoteEnd>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accepted, remotes) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                refusing: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            remotes,
        )
    }

    /// Fail every handshake while `refuse` is set
    pub fn refuse(&self, refuse: bool) {
        self.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Handshakes attempted so far, refused ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(ApplierError::Transport(format!("Connection to {} refused", url)));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let remote = RemoteEnd {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.accepted
            .send(remote)
            .map_err(|_| ApplierError::Transport(format!("Nobody listening on {}", url)))?;

        Ok(Link { outbound, inbound })
    }
}
