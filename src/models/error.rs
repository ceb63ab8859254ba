//! Error types for refund-audit.
//!
//! Taxonomy:
//! - Expected failures: bad input, unknown task, illegal transition
//! - Infrastructure failures: storage, classification service
//! - Invariant violations: bugs

use std::path::PathBuf;
use thiserror::Error;

use super::TaskStatus;

/// Top-level error type for refund-audit.
#[derive(Debug, Error)]
pub enum AuditError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED — operator or input mistakes
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cannot {action} task {task_id} while it is {status}")]
    InvalidTransition {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Missing credentials for the classification service")]
    MissingCredentials,

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE — storage or remote service went bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Persistence error: {context}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint {path}: {message}")]
    CorruptCheckpoint { path: PathBuf, message: String },

    #[error("Classification service error: {0}")]
    Service(#[from] ServiceError),

    // ═══════════════════════════════════════════════════════════════════
    // INVARIANT VIOLATED — should not happen
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by the external classification service.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("rate limited by service")]
    RateLimited { retry_after_secs: Option<f64> },

    #[error("service busy (status {status})")]
    Busy { status: u16 },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl AuditError {
    /// Create a persistence error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Persistence {
            context: context.into(),
            source,
        }
    }

    /// True for storage failures that force a task into `error`.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::CorruptCheckpoint { .. })
    }
}

impl ServiceError {
    /// Check if this error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Busy { .. }
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::InvalidResponse(_)
        )
    }

    /// Get retry delay hint in seconds, if the service sent one.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for refund-audit.
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ServiceError::Busy { status: 503 }.is_retryable());
        assert!(ServiceError::RateLimited { retry_after_secs: None }.is_retryable());
        assert!(ServiceError::InvalidResponse("no choices".into()).is_retryable());
        assert!(!ServiceError::AuthenticationFailed.is_retryable());
        assert!(!ServiceError::Api {
            status: 400,
            message: "bad image".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_persistence_errors_are_flagged() {
        let err = AuditError::io(
            "writing task record",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(err.is_persistence());
        assert!(!AuditError::MissingCredentials.is_persistence());
    }
}
