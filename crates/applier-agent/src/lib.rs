//! Page agent for Applier
//!
//! Everything that runs in the page context of the target site:
//!
//! - [`queue`]: pure job state machine and the persisted job queue
//! - [`responder`]: exactly-once reply guard for controller requests
//! - [`agent`]: the per-document [`PageAgent`]
//! - [`host`]: [`InProcessTabs`], a tab host that replaces agents on every load

pub mod agent;
pub mod host;
pub mod queue;
pub mod responder;

pub use agent::{AgentTasks, PageAgent};
pub use host::InProcessTabs;
pub use queue::{
    transition, JobAction, JobEvent, JobQueue, JobState, NavigationAttempts, QueueSource,
};
pub use responder::Responder;
