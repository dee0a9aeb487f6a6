//! Saga error types.

use common::SagaId;
use outbox::{BusError, OutboxError};
use thiserror::Error;
use tx_store::StoreError;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The transactional store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduling a message in the outbox failed.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Subscribing to an event topic failed.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// An event referenced a step the saga does not have.
    #[error("Saga {saga_id} has no step {step_index}")]
    StepOutOfRange { saga_id: SagaId, step_index: usize },

    /// A saga definition without steps cannot be started.
    #[error("Saga definition '{0}' has no steps")]
    EmptyDefinition(String),

    /// A step failed more often than its retry budget allows.
    #[error("Step '{step}' exhausted its retries ({max_retries})")]
    RetriesExhausted { step: String, max_retries: u32 },

    /// A stored state value could not be interpreted.
    #[error("Invalid saga state: {0}")]
    InvalidState(String),
}

impl SagaError {
    /// Returns true if handling the same event again may succeed.
    ///
    /// Event consumers nack retryable failures so the broker redelivers them,
    /// and ack everything else after logging.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Store(e) => is_transient(e),
            SagaError::Outbox(OutboxError::Store(e)) => is_transient(e),
            SagaError::Outbox(OutboxError::Bus(_)) | SagaError::Bus(_) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for SagaError {
    fn from(e: sqlx::Error) -> Self {
        SagaError::Store(StoreError::from(e))
    }
}

fn is_transient(e: &StoreError) -> bool {
    matches!(e, StoreError::Database(_) | StoreError::CommitRejected(_))
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_retryable() {
        let err = SagaError::from(StoreError::CommitRejected("x".into()));
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_saga_is_terminal() {
        assert!(!SagaError::NotFound(SagaId::from("s-1")).is_retryable());
        let err = SagaError::StepOutOfRange {
            saga_id: SagaId::from("s-1"),
            step_index: 9,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Saga s-1 has no step 9");
    }
}
