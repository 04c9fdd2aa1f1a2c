//! Construction/validation errors for domain entities.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    ExternalError(String),
}

impl From<pipeline_core::CoreError> for DomainError {
    fn from(e: pipeline_core::CoreError) -> Self {
        DomainError::ExternalError(e.to_string())
    }
}
