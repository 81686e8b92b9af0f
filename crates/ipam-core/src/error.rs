//! Error types for the IPAM automation core
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for IPAM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the IPAM automation core
#[derive(Error, Debug)]
pub enum Error {
    /// A mutating call was made without `confirm=true`
    #[error("Confirmation required: {operation} was called without confirm=true")]
    ConfirmationRequired {
        /// The operation that was refused (e.g. "create dcim.sites")
        operation: String,
    },

    /// The requested API domain is not one the remote system exposes
    #[error("Unknown API domain: {0}")]
    UnknownDomain(String),

    /// Bad input shape or values (local or reported by the remote)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A reference or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate, overlap, or ambiguous reference
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transport failure or remote 5xx
    #[error("Remote system error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    RemoteSystem {
        /// HTTP status, if the remote answered at all
        status: Option<u16>,
        /// Error message
        message: String,
    },

    /// Async submission with no reachable broker
    #[error("Task queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Authentication errors (401/403)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Unknown task identifier
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Broker storage errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a confirmation-required error
    pub fn confirmation_required(operation: impl Into<String>) -> Self {
        Self::ConfirmationRequired {
            operation: operation.into(),
        }
    }

    /// Create an unknown-domain error
    pub fn unknown_domain(domain: impl Into<String>) -> Self {
        Self::UnknownDomain(domain.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a remote system error
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::RemoteSystem {
            status,
            message: message.into(),
        }
    }

    /// Create a queue-unavailable error
    pub fn queue_unavailable(msg: impl Into<String>) -> Self {
        Self::QueueUnavailable(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable, machine-readable tag for this error class
    ///
    /// Recorded in per-operation batch results and task summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfirmationRequired { .. } => "confirmation_required",
            Error::UnknownDomain(_) => "unknown_domain",
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::RemoteSystem { .. } => "remote_system_error",
            Error::QueueUnavailable(_) => "queue_unavailable",
            Error::Authentication(_) => "authentication_failed",
            Error::TaskNotFound(_) => "task_not_found",
            Error::Broker(_) => "broker_error",
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Other(_) => "other",
        }
    }

    /// Whether the caller may reasonably retry
    ///
    /// The client never retries on its own; this is only a hint.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RemoteSystem { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(Error::not_found("x").kind(), "not_found");
        assert_eq!(Error::confirmation_required("create").kind(), "confirmation_required");
        assert_eq!(Error::queue_unavailable("down").kind(), "queue_unavailable");
    }

    #[test]
    fn test_remote_error_display_includes_status() {
        let err = Error::remote(Some(503), "service unavailable");
        assert_eq!(err.to_string(), "Remote system error (503): service unavailable");

        let err = Error::remote(None, "connection refused");
        assert_eq!(err.to_string(), "Remote system error: connection refused");
        assert!(err.is_transient());
        assert!(!Error::conflict("dup").is_transient());
    }
}
