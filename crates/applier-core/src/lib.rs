//! # applier-core
//!
//! Core types for the Applier proposal automation system.
//!
//! Applier coordinates three independently-lifecycled contexts:
//!
//! - **Controller**: long-lived; owns the session transport to the remote job
//!   source and dispatches work to pages
//! - **Page agent**: loaded into every page of the target site; destroyed and
//!   recreated on each navigation
//! - **Control surface**: operator-facing commands and status
//!
//! No memory is shared between contexts. Everything they exchange is defined
//! here: the data model, the message taxonomy, the durable key-value store and
//! the tab-host contract.

pub mod config;
mod error;
pub mod fail_open;
pub mod protocol;
pub mod store;
pub mod tabs;
mod types;

pub use config::ApplierConfig;
pub use error::{ApplierError, Result};
pub use protocol::{
    ClientMessage, ControlCommand, ControlResponse, DispatchAck, PageRequest, PageResponse,
    ServerMessage, StatusReport,
};
pub use store::{keys, JsonFileStore, KeyValueStore, MemoryStore};
pub use tabs::{AgentReport, TabHost};
pub use types::*;
