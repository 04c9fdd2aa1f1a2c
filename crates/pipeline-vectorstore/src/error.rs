//! Vector store errors. A dimension mismatch is fatal at startup, which
//! is why it gets its own variant instead of collapsing into
//! `Transient`/`Permanent`.

use pipeline_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("transient HTTP/connection error: {0}")]
    Transient(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl VectorStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VectorStoreError::Transient(_))
    }
}

impl From<VectorStoreError> for CoreError {
    fn from(e: VectorStoreError) -> Self {
        if e.is_transient() {
            CoreError::TransientError(e.to_string())
        } else {
            CoreError::PermanentError(e.to_string())
        }
    }
}
