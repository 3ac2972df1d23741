//! Message taxonomy shared by the controller, page agents and control surface
//!
//! Three channels carry these messages:
//! - remote job source <-> controller: [`ServerMessage`] in, [`ClientMessage`] out,
//!   JSON envelopes tagged by `type`
//! - controller -> page agent: [`PageRequest`] answered by exactly one [`PageResponse`]
//! - control surface -> controller: [`ControlCommand`] answered by [`ControlResponse`]

use crate::types::{ConnectionState, JobDescriptor, JobOutcome, LoginState};
use crate::{ApplierError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound envelope from the remote job source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JobApplication {
        #[serde(rename = "jobData", default)]
        job_data: Option<JobDescriptor>,
    },
    JobQueue {
        #[serde(default)]
        jobs: Vec<JobDescriptor>,
    },
    LoginRequired,
    StatusUpdate {
        #[serde(default)]
        status: String,
    },
    /// Any envelope type this build does not know about
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse one text frame
    pub fn parse(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobApplication { .. } => "job_application",
            Self::JobQueue { .. } => "job_queue",
            Self::LoginRequired => "login_required",
            Self::StatusUpdate { .. } => "status_update",
            Self::Unknown => "unknown",
        }
    }
}

/// Outbound envelope to the remote job source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    ExtensionConnected { session_id: String },
    #[serde(rename_all = "camelCase")]
    LoginStatus {
        is_logged_in: bool,
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JobCompleted {
        job_id: String,
        success: bool,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    JobFailed { job_id: String, error: String },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExtensionConnected { .. } => "extension_connected",
            Self::LoginStatus { .. } => "login_status",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
        }
    }

    /// Terminal job reports must not be lost while the transport is down
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::JobCompleted { .. } | Self::JobFailed { .. })
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<JobOutcome> for ClientMessage {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed {
                job_id,
                success,
                message,
            } => Self::JobCompleted {
                job_id,
                success,
                message,
            },
            JobOutcome::Failed { job_id, error } => Self::JobFailed { job_id, error },
        }
    }
}

/// Request from the controller to the page agent of one tab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PageRequest {
    Ping,
    ProcessJob {
        #[serde(rename = "jobData", default)]
        job_data: Option<JobDescriptor>,
    },
    ProcessJobQueue {
        #[serde(rename = "jobQueue")]
        job_queue: Vec<JobDescriptor>,
    },
    CheckLoginStatus,
    GetPageInfo,
}

impl PageRequest {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ProcessJob { .. } => "process_job",
            Self::ProcessJobQueue { .. } => "process_job_queue",
            Self::CheckLoginStatus => "check_login_status",
            Self::GetPageInfo => "get_page_info",
        }
    }

    /// Requests whose handler may outlive the acknowledgement window
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::ProcessJob { .. } | Self::ProcessJobQueue { .. })
    }

    /// Job ids carried by this request, in queue order
    pub fn job_ids(&self) -> Vec<String> {
        match self {
            Self::ProcessJob { job_data } => {
                job_data.iter().map(|job| job.job_id.clone()).collect()
            }
            Self::ProcessJobQueue { job_queue } => {
                job_queue.iter().map(|job| job.job_id.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// What the page agent did with a dispatched job or queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAck {
    /// Persisted; navigation to the head job's page has started
    Navigating,
    /// Persisted; the head job is being processed on the current page
    Processing,
    /// Persisted; the handler did not answer within the acknowledgement window
    Initiated,
    /// Nothing to do
    Empty,
}

/// The single reply to a [`PageRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageResponse {
    Pong,
    Accepted {
        ack: DispatchAck,
        message: String,
    },
    LoginStatus {
        state: LoginState,
    },
    #[serde(rename_all = "camelCase")]
    PageInfo {
        url: String,
        title: String,
        is_target_site: bool,
    },
    Error {
        error: String,
    },
}

impl PageResponse {
    pub fn accepted(ack: DispatchAck, message: impl Into<String>) -> Self {
        Self::Accepted {
            ack,
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Convert an error reply into an `ApplierError`
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error { error } => Err(ApplierError::Other(error)),
            other => Ok(other),
        }
    }
}

/// Command issued by the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    ConnectToSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    StartSession,
    GetStatus,
    ConfirmLogin {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    Disconnect,
}

/// Controller state as exposed to the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: bool,
    pub session_id: Option<String>,
    pub connection_state: ConnectionState,
    pub badge: String,
    pub last_status: Option<String>,
    pub login_required: bool,
    pub pending_results: usize,
    /// When the current connection opened
    pub connected_since: Option<DateTime<Utc>>,
}

/// Reply to a [`ControlCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Session {
        session_id: String,
        is_logged_in: bool,
        message: String,
    },
    Status(StatusReport),
    Error {
        error: String,
    },
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::Ok {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }
}

impl From<ApplierError> for ControlResponse {
    fn from(err: ApplierError) -> Self {
        Self::Error {
            error: err.to_string(),
        }
    }
}
