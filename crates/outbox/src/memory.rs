use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tx_store::MemoryTransaction;

use crate::store::{OutboxEntry, OutboxStore};
use crate::{Message, Metadata};

const TABLE: &str = "outbox";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboxRow {
    id: i64,
    topic: String,
    payload: Vec<u8>,
    headers: Metadata,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

fn row_key(id: i64) -> String {
    format!("{id:020}")
}

/// In-memory outbox store for testing, backed by a [`tx_store::MemoryDatabase`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryOutboxStore;

impl MemoryOutboxStore {
    /// Creates a new in-memory outbox store.
    pub fn new() -> Self {
        Self
    }

    /// Returns every entry, delivered or not, in insertion order.
    pub fn all_entries(tx: &MemoryTransaction) -> tx_store::Result<Vec<(OutboxEntry, bool)>> {
        tx.tables()
            .rows(TABLE)
            .map(|(_, value)| -> tx_store::Result<(OutboxEntry, bool)> {
                let row: OutboxRow = serde_json::from_value(value.clone())?;
                let sent = row.sent_at.is_some();
                Ok((row.into_entry(), sent))
            })
            .collect()
    }
}

impl OutboxRow {
    fn into_entry(self) -> OutboxEntry {
        OutboxEntry {
            id: self.id.to_string(),
            topic: self.topic,
            payload: self.payload,
            headers: self.headers,
        }
    }
}

#[async_trait]
impl OutboxStore<MemoryTransaction> for MemoryOutboxStore {
    async fn insert_tx(
        &self,
        tx: &mut MemoryTransaction,
        topic: &str,
        message: &Message,
    ) -> tx_store::Result<()> {
        let tables = tx.tables_mut();
        let id = tables.next_sequence(TABLE);
        let row = OutboxRow {
            id,
            topic: topic.to_string(),
            payload: message.payload.clone(),
            headers: message.metadata.clone(),
            created_at: Utc::now(),
            sent_at: None,
        };
        tables.upsert_row(TABLE, row_key(id), &row)
    }

    async fn get_pending_tx(
        &self,
        tx: &mut MemoryTransaction,
        limit: usize,
    ) -> tx_store::Result<Vec<OutboxEntry>> {
        let mut pending = Vec::new();
        for (_, value) in tx.tables().rows(TABLE) {
            if pending.len() >= limit {
                break;
            }
            let row: OutboxRow = serde_json::from_value(value.clone())?;
            if row.sent_at.is_none() {
                pending.push(row.into_entry());
            }
        }
        Ok(pending)
    }

    async fn mark_sent_tx(&self, tx: &mut MemoryTransaction, ids: &[String]) -> tx_store::Result<()> {
        let now = Utc::now();
        let tables = tx.tables_mut();
        for id in ids {
            // IDs that are not sequence numbers cannot match any row
            let Ok(seq) = id.parse::<i64>() else {
                continue;
            };
            let key = row_key(seq);
            if let Some(mut row) = tables.get_row::<OutboxRow>(TABLE, &key)? {
                row.sent_at = Some(now);
                tables.upsert_row(TABLE, key, &row)?;
            }
        }
        Ok(())
    }

    async fn pending_count_tx(&self, tx: &mut MemoryTransaction) -> tx_store::Result<usize> {
        let mut count = 0;
        for (_, value) in tx.tables().rows(TABLE) {
            let row: OutboxRow = serde_json::from_value(value.clone())?;
            if row.sent_at.is_none() {
                count += 1;
            }
        }
        Ok(count)
    }
}
