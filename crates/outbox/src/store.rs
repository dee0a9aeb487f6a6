use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Message, Metadata};

/// A pending outbox row, as read by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Store-assigned ID, the string form of the row sequence.
    pub id: String,

    /// Topic the message is published to.
    pub topic: String,

    /// Serialized message body.
    pub payload: Vec<u8>,

    /// Headers attached to the message on publish.
    pub headers: Metadata,
}

impl OutboxEntry {
    /// Builds the bus message for this entry.
    pub fn to_message(&self) -> Message {
        Message::new(self.payload.clone()).with_metadata(self.headers.clone())
    }
}

/// Persistence for outgoing messages.
///
/// Every method works inside the caller's transaction and never commits.
/// No bus I/O happens here.
#[async_trait]
pub trait OutboxStore<Tx: Send>: Send + Sync {
    /// Writes one pending entry.
    async fn insert_tx(&self, tx: &mut Tx, topic: &str, message: &Message) -> tx_store::Result<()>;

    /// Returns up to `limit` undelivered entries, oldest first.
    async fn get_pending_tx(&self, tx: &mut Tx, limit: usize) -> tx_store::Result<Vec<OutboxEntry>>;

    /// Marks exactly the given entries as delivered.
    ///
    /// An empty `ids` slice is a no-op.
    async fn mark_sent_tx(&self, tx: &mut Tx, ids: &[String]) -> tx_store::Result<()>;

    /// Returns the number of undelivered entries.
    async fn pending_count_tx(&self, tx: &mut Tx) -> tx_store::Result<usize>;
}
