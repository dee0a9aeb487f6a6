use tx_store::StoreError;
use thiserror::Error;

/// Errors raised by a message bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The broker refused or failed to accept a message.
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// A subscription could not be established.
    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Errors that can occur when scheduling or relaying outbox messages.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The transactional store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The message bus failed.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
