//! Reconnecting session transport
//!
//! One streaming connection per session, keyed by session id. The transport
//! publishes its [`ConnectionState`] on a watch channel and emits
//! [`TransportEvent`]s on an unbounded channel owned by the controller.
//!
//! Reconnection is driven by closure only: a failed handshake or read error
//! moves the state to `Error`, the closure that follows moves it to
//! `Disconnected`, and a new attempt starts after the fixed reconnect delay.
//! An explicit [`SessionTransport::disconnect`] stops the loop for good.

use applier_core::config::TransportConfig;
use applier_core::{ApplierError, ClientMessage, ConnectionState, Result, ServerMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Error(String),
    Closed,
}

/// Both directions of one open connection.
///
/// Dropping `outbound` closes the connection. `inbound` ends with
/// [`LinkEvent::Closed`] or simply runs dry.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to the job source
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link>;
}

/// [`Connector`] speaking WebSocket through tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ApplierError::Transport(format!("WebSocket connect to {} failed: {}", url, e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outgoing) = mpsc::unbounded_channel::<String>();
        let (incoming, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(WsMessage::Text(t)) => LinkEvent::Text(t.to_string()),
                    Ok(WsMessage::Binary(b)) => match String::from_utf8(b.to_vec()) {
                        Ok(text) => LinkEvent::Text(text),
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        debug!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    // tungstenite answers pings itself
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = incoming.send(LinkEvent::Error(e.to_string()));
                        break;
                    }
                };
                if incoming.send(event).is_err() {
                    return;
                }
            }
            let _ = incoming.send(LinkEvent::Closed);
        });

        Ok(Link { outbound, inbound })
    }
}

/// What the transport tells the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was established
    Opened,
    /// A known message arrived
    Message(ServerMessage),
    /// An open connection was lost; a reconnect is scheduled
    Closed,
}

/// Everything the connection loop shares with the transport handle
#[derive(Clone)]
struct ConnectionLoop {
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionLoop {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event dropped, controller is gone");
        }
    }

    async fn run(self, url: String) {
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connector.connect(&url).await {
                Ok(link) => {
                    self.session(link).await;
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(TransportEvent::Closed);
                }
                Err(e) => {
                    warn!("Session transport handshake failed: {}", e);
                    self.set_state(ConnectionState::Error);
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            info!("Reconnecting in {:?}", self.reconnect_delay);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Pump one open link until it closes
    async fn session(&self, link: Link) {
        let Link {
            outbound,
            mut inbound,
        } = link;
        *lock(&self.outbound) = Some(outbound);
        self.set_state(ConnectionState::Connected);
        info!("Session transport connected");
        self.emit(TransportEvent::Opened);

        while let Some(event) = inbound.recv().await {
            match event {
                LinkEvent::Text(frame) => match ServerMessage::parse(&frame) {
                    Ok(ServerMessage::Unknown) => debug!("Ignoring message of unknown type: {}", frame),
                    Ok(message) => {
                        debug!("Received {}", message.kind());
                        self.emit(TransportEvent::Message(message));
                    }
                    Err(e) => warn!("Ignoring malformed frame: {}", e),
                },
                LinkEvent::Error(e) => {
                    warn!("Session transport error: {}", e);
                    self.set_state(ConnectionState::Error);
                }
                LinkEvent::Closed => break,
            }
        }

        lock(&self.outbound).take();
        info!("Session transport closed");
    }
}

/// Reconnecting streaming connection to the job source
pub struct SessionTransport {
    ws_base: String,
    inner: ConnectionLoop,
    task: Mutex<Option<AbortHandle>>,
}

impl SessionTransport {
    /// Create a transport and the receiver its events arrive on
    pub fn new(
        connector: Arc<dyn Connector>,
        ws_base: impl Into<String>,
        config: &TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let transport = Self {
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
            inner: ConnectionLoop {
                connector,
                reconnect_delay: config.reconnect_delay(),
                state: Arc::new(state),
                outbound: Arc::new(Mutex::new(None)),
                events,
            },
            task: Mutex::new(None),
        };
        (transport, receiver)
    }

    /// Streaming endpoint of `session_id`
    pub fn session_url(&self, session_id: &str) -> String {
        format!("{}/ws/{}", self.ws_base, session_id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Open the connection for `session_id`, replacing any previous one
    pub fn connect(&self, session_id: &str) {
        let url = self.session_url(session_id);
        self.stop();
        self.inner.set_state(ConnectionState::Connecting);
        info!("Connecting session transport to {}", url);

        let task = tokio::spawn(self.inner.clone().run(url)).abort_handle();
        *lock(&self.task) = Some(task);
    }

    /// Send one message. Fails with `NotConnected` when there is no open
    /// connection; nothing is queued.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_frame()?;
        let outbound = lock(&self.inner.outbound);
        let sent = match outbound.as_ref() {
            Some(tx) if self.state().is_connected() => tx.send(frame).is_ok(),
            _ => false,
        };

        if sent {
            debug!("Sent {}", message.kind());
            Ok(())
        } else {
            warn!("Transport not connected, dropping {}", message.kind());
            Err(ApplierError::NotConnected(message.kind().to_string()))
        }
    }

    /// Close the connection without reconnecting
    pub fn disconnect(&self) {
        if self.stop() {
            info!("Session transport disconnected");
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    fn stop(&self) -> bool {
        let task = lock(&self.task).take();
        lock(&self.inner.outbound).take();
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
