//! Unified error types for Applier

use thiserror::Error;

/// Unified error type for all Applier operations
#[derive(Error, Debug)]
pub enum ApplierError {
    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected, dropped {0}")]
    NotConnected(String),

    #[error("Session bootstrap failed: {0}")]
    Bootstrap(String),

    // Dispatch errors
    #[error("Content script failed to load after {attempts} attempts")]
    DispatchTimeout { attempts: u32 },

    #[error("Page agent unavailable on tab {0}")]
    AgentUnavailable(String),

    #[error("Page context destroyed before responding: {0}")]
    ContextDestroyed(String),

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Tab not found: {0}")]
    TabNotFound(String),

    #[error("Delivery unconfirmed, the page may hold the work: {0}")]
    DeliveryUnconfirmed(String),

    // Automation errors
    #[error("{0}")]
    Automation(String),

    #[error("Browser error: {0}")]
    Browser(String),

    // Persistence errors
    #[error("Corrupt persisted record '{key}': {reason}")]
    PersistenceCorruption { key: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl ApplierError {
    /// Whether the error only affects the job being processed.
    ///
    /// Queue-level and transport-level code uses this to decide whether to
    /// advance past a job or to stop the current dispatch.
    pub fn is_job_local(&self) -> bool {
        matches!(
            self,
            Self::Automation(_) | Self::Browser(_) | Self::InvalidSelector { .. }
        )
    }

    /// Whether a request reached the page agent but its reply never arrived.
    ///
    /// The agent persists work before replying, so the work may be pending
    /// in the page even though the controller saw an error.
    pub fn reply_lost(&self) -> bool {
        matches!(self, Self::ContextDestroyed(_) | Self::RequestTimeout(_))
    }
}

/// Result type alias using ApplierError
pub type Result<T> = std::result::Result<T, ApplierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_timeout_message() {
        let err = ApplierError::DispatchTimeout { attempts: 10 };
        assert_eq!(
            err.to_string(),
            "Content script failed to load after 10 attempts"
        );
    }

    #[test]
    fn test_job_local_classification() {
        assert!(ApplierError::Automation("Apply button not found".into()).is_job_local());
        assert!(!ApplierError::Transport("closed".into()).is_job_local());
        assert!(!ApplierError::DispatchTimeout { attempts: 3 }.is_job_local());
    }

    #[test]
    fn test_reply_lost_classification() {
        assert!(ApplierError::ContextDestroyed("tab-1".into()).reply_lost());
        assert!(ApplierError::RequestTimeout("tab-1".into()).reply_lost());
        assert!(!ApplierError::DispatchTimeout { attempts: 10 }.reply_lost());
        assert!(!ApplierError::AgentUnavailable("tab-1".into()).reply_lost());
    }
}
