//! Bus errors. Publish failures cover broker rejection, an unroutable
//! target, or a broker-acknowledged persistence failure — none of them
//! are ever silently dropped; they all surface to the caller. Subscribe
//! failures cover declaration/consumption errors.

use pipeline_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish rejected by broker: {0}")]
    PublishRejected(String),
    #[error("unroutable: no queue/subscription matches routing key {0}")]
    Unroutable(String),
    #[error("broker-acknowledged persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("subscribe/declare failed: {0}")]
    SubscribeFailed(String),
    #[error("transient connection error: {0}")]
    TransientConnection(String),
    #[error("event failed schema validation: {0}")]
    ValidationError(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::TransientConnection(_))
    }
}

impl From<BusError> for CoreError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::ValidationError(msg) => CoreError::ValidationError(msg),
            BusError::TransientConnection(msg) => CoreError::TransientError(msg),
            other => CoreError::PermanentError(other.to_string()),
        }
    }
}
