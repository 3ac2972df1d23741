//! Controller context for Applier
//!
//! The long-lived side of the system:
//!
//! - [`transport`]: reconnecting streaming connection to the job source
//! - [`dispatcher`]: liveness probing and request routing to page agents
//! - [`login`]: login state from page evidence or tab URLs
//! - [`outbox`]: terminal job results held while disconnected
//! - [`bootstrap`]: session creation over HTTP
//! - [`controller`]: the [`Controller`] tying them together
//!
//! The `test-support` feature adds [`channel`], an in-process job source.

pub mod bootstrap;
#[cfg(any(test, feature = "test-support"))]
pub mod channel;
pub mod controller;
pub mod dispatcher;
pub mod login;
pub mod outbox;
pub mod transport;

pub use bootstrap::{HttpSessionApi, SessionApi};
pub use controller::Controller;
pub use dispatcher::Dispatcher;
pub use login::LoginMonitor;
pub use outbox::ResultOutbox;
pub use transport::{
    Connector, Link, LinkEvent, SessionTransport, TransportEvent, WebSocketConnector,
};
