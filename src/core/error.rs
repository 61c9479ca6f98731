//! Error types for scheduler, worker and guard operations.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the scheduling machinery itself.
///
/// Usage errors (`ShuttingDown`, `ShutdownAlreadyRequested`) are returned
/// synchronously to the caller that misused the component; they are never
/// queued or swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Work was submitted after shutdown had been requested.
    #[error("scheduler is shutting down: {0}")]
    ShuttingDown(String),
    /// Shutdown was requested a second time.
    #[error("shutdown already requested: {0}")]
    ShutdownAlreadyRequested(String),
    /// An execution resource failed to shut down cleanly.
    #[error("executor shutdown failed: {0}")]
    ExecutorShutdown(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure delivered through an operation's own callback.
///
/// Cloneable so a single failure can be logged and forwarded.
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    /// The operation exceeded its time budget and was force-failed.
    #[error("operation <{label}> timed out after {elapsed:?} (budget {timeout:?})")]
    Timeout {
        /// Description of the stalled operation.
        label: String,
        /// Time spent in flight when the timeout was detected.
        elapsed: Duration,
        /// Configured budget.
        timeout: Duration,
    },
    /// `apply` panicked before reporting a result.
    #[error("operation panicked: {0}")]
    Panicked(String),
    /// The operation reported a failure.
    #[error("operation failed: {0}")]
    Failed(Arc<anyhow::Error>),
}

impl OperationError {
    /// Wrap any error as an operation failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// Build a failure from a plain message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Failed(Arc::new(anyhow::anyhow!("{message}")))
    }

    /// Whether this failure was injected by a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Convert a caught panic payload into an error.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        Self::Panicked(panic_message(payload))
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_error_display() {
        let err = SchedulerError::ShuttingDown("db".into());
        assert_eq!(format!("{err}"), "scheduler is shutting down: db");

        let err = SchedulerError::ShutdownAlreadyRequested("db".into());
        assert_eq!(format!("{err}"), "shutdown already requested: db");
    }

    #[test]
    fn test_timeout_error() {
        let err = OperationError::Timeout {
            label: "fetch".into(),
            elapsed: Duration::from_millis(20),
            timeout: Duration::from_millis(10),
        };
        assert!(err.is_timeout());
        assert!(format!("{err}").starts_with("operation <fetch> timed out"));
    }

    #[test]
    fn test_failed_wraps_anyhow() {
        let err = OperationError::msg("disk full");
        assert!(!err.is_timeout());
        assert_eq!(format!("{err}"), "operation failed: disk full");

        let io = std::io::Error::other("broken pipe");
        let err = OperationError::failed(io);
        assert_eq!(format!("{err}"), "operation failed: broken pipe");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        match OperationError::from_panic(payload.as_ref()) {
            OperationError::Panicked(msg) => assert_eq!(msg, "bang"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
