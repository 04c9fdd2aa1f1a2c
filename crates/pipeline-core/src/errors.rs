//! Pipeline error taxonomy.
//!
//! Four semantic variants govern every retry decision in the system:
//! `ValidationError` is never retried, `TransientError` is the only type
//! that flows through `retry::retry_with_backoff`, `PermanentError` marks
//! the document `failed` immediately, and `PoisonMessage` is the variant
//! the bus produces when the same message fails twice.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The event failed schema validation at publish time. Never retried;
    /// propagated to the caller.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Transient error (timeout, reset connection, 5xx). Candidate for
    /// `retry_with_backoff`.
    #[error("transient error: {0}")]
    TransientError(String),

    /// Data-shape error or impossible precondition. Not retried; the
    /// stage publishes its `*.failed` event and marks the document
    /// `failed`.
    #[error("permanent error: {0}")]
    PermanentError(String),

    /// The same message was redelivered and failed again with the same
    /// handler exception. Routed to `<stage>.failed`.
    #[error("poison message after {attempts} attempts: {source}")]
    PoisonMessage { attempts: u32, source: String },

    /// (De)serialization or hash computation failure, never a business
    /// error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable classification stages use to decide whether something is
    /// retryable via `retry_with_backoff`.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientError(_))
    }

    /// Stable variant name used for metric tags
    /// (`failures_total{error_type=...}`).
    pub fn error_type(&self) -> &'static str {
        match self {
            CoreError::ValidationError(_) => "ValidationError",
            CoreError::TransientError(_) => "TransientError",
            CoreError::PermanentError(_) => "PermanentError",
            CoreError::PoisonMessage { .. } => "PoisonMessage",
            CoreError::Internal(_) => "Internal",
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {e}"))
    }
}
