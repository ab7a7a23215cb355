//! Error types for bridge operations

use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Coarse error classes the pipeline reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or invalid setting, fatal at startup
    Config,
    /// Store or network failure, retried locally at the call site
    TransientIo,
    /// Feeder or filter task terminated, observed by the liveness supervisor
    FatalTask,
    /// A single record failed, routed to the retry queue
    Item,
}

/// Errors that can occur while synchronizing records
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Invalid or missing configuration value
    #[error("Configuration error for '{key}': {reason}")]
    Config { key: String, reason: String },

    /// Bulk stamp lookup against the target store failed
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// Target store operation failed
    #[error("Storage error ({backend}): {reason}")]
    Storage { backend: String, reason: String },

    /// Upstream API returned an unexpected status
    #[error("Upstream error (status {status}): {reason}")]
    Upstream { status: u16, reason: String },

    /// Upstream request could not be completed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Record is not (yet) visible upstream
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Record was permanently removed upstream
    #[error("Resource gone: {0}")]
    Gone(String),

    /// Upstream is rate limiting this client
    #[error("Request throttled: {0}")]
    Throttled(String),

    /// A long-running task stopped after exhausting its retries
    #[error("Task '{task}' terminated: {reason}")]
    TaskTerminated { task: String, reason: String },

    /// Fetch or store of a single record failed
    #[error("Item '{id}' failed: {reason}")]
    ItemFailed { id: String, reason: String },

    /// API client handle could not be constructed
    #[error("Client creation failed: {0}")]
    ClientCreation(String),

    /// Serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Operation interrupted by shutdown
    #[error("Shutdown in progress")]
    Shutdown,
}

impl BridgeError {
    /// Create a configuration error for `key`
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error tagged with the backend name
    pub fn storage(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create an item failure
    pub fn item(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ItemFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a task termination error
    pub fn task_terminated(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TaskTerminated {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Map the error onto the class the pipeline uses to decide what to do
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config { .. } => ErrorClass::Config,
            Self::Lookup(_)
            | Self::Storage { .. }
            | Self::Upstream { .. }
            | Self::Connection(_)
            | Self::Throttled(_)
            | Self::ClientCreation(_) => ErrorClass::TransientIo,
            Self::TaskTerminated { .. } | Self::Shutdown => ErrorClass::FatalTask,
            Self::NotFound(_) | Self::Gone(_) | Self::ItemFailed { .. } | Self::Serialization(_) => {
                ErrorClass::Item
            }
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => *status >= 500,
            Self::Gone(_) | Self::Config { .. } | Self::Shutdown => false,
            _ => true,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            BridgeError::config("resources_api_server", "missing").class(),
            ErrorClass::Config
        );
        assert_eq!(
            BridgeError::Lookup("timeout".into()).class(),
            ErrorClass::TransientIo
        );
        assert_eq!(
            BridgeError::task_terminated("filter", "lookup exhausted").class(),
            ErrorClass::FatalTask
        );
        assert_eq!(BridgeError::item("42", "boom").class(), ErrorClass::Item);
    }

    #[test]
    fn test_retryable() {
        assert!(
            BridgeError::Upstream {
                status: 502,
                reason: String::new()
            }
            .is_retryable()
        );
        assert!(
            !BridgeError::Upstream {
                status: 400,
                reason: String::new()
            }
            .is_retryable()
        );
        assert!(!BridgeError::Gone("x".into()).is_retryable());
        assert!(BridgeError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_config_message_names_key() {
        let err = BridgeError::config("up_wait_sleep", "must be at least 30");
        assert_eq!(
            err.to_string(),
            "Configuration error for 'up_wait_sleep': must be at least 30"
        );
    }
}
