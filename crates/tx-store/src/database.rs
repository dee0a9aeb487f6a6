use async_trait::async_trait;

use crate::Result;

/// An open database transaction.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it
/// back, so an early `?` return never leaks partial writes.
#[async_trait]
pub trait Transaction: Send {
    /// Makes every write of this transaction visible to later transactions.
    async fn commit(self) -> Result<()>;

    /// Discards every write of this transaction.
    async fn rollback(self) -> Result<()>;
}

/// A database able to open transactions.
///
/// Implementations must be thread-safe; a single instance is shared by the
/// dispatcher and every orchestrator handler.
#[async_trait]
pub trait Database: Send + Sync {
    /// The transaction type handed to stores.
    type Tx: Transaction + 'static;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;
}
