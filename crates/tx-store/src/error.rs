use thiserror::Error;

/// Errors raised by a transactional store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A row could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend refused to commit; nothing from the transaction was kept.
    #[error("Commit rejected: {0}")]
    CommitRejected(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
