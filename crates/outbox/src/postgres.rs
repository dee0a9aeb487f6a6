use async_trait::async_trait;
use sqlx::Row;
use tx_store::PgTransaction;

use crate::store::{OutboxEntry, OutboxStore};
use crate::{Message, Metadata};

/// PostgreSQL outbox store over the `outbox` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgOutboxStore;

impl PgOutboxStore {
    /// Creates a new PostgreSQL outbox store.
    pub fn new() -> Self {
        Self
    }

    /// Creates the `outbox` table if it does not exist.
    pub async fn init_schema(&self, tx: &mut PgTransaction) -> tx_store::Result<()> {
        sqlx::raw_sql(include_str!("../../../migrations/001_create_outbox_table.sql"))
            .execute(tx.conn())
            .await?;
        Ok(())
    }
}

fn decode_headers(id: i64, raw: Option<serde_json::Value>) -> Metadata {
    match raw {
        None | Some(serde_json::Value::Null) => Metadata::new(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::warn!(entry_id = id, error = %e, "ignoring unreadable outbox headers");
            Metadata::new()
        }),
    }
}

#[async_trait]
impl OutboxStore<PgTransaction> for PgOutboxStore {
    async fn insert_tx(
        &self,
        tx: &mut PgTransaction,
        topic: &str,
        message: &Message,
    ) -> tx_store::Result<()> {
        let headers = serde_json::to_value(&message.metadata)?;

        sqlx::query("INSERT INTO outbox (topic, payload, headers) VALUES ($1, $2, $3)")
            .bind(topic)
            .bind(&message.payload)
            .bind(headers)
            .execute(tx.conn())
            .await?;

        Ok(())
    }

    async fn get_pending_tx(
        &self,
        tx: &mut PgTransaction,
        limit: usize,
    ) -> tx_store::Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, payload, headers
            FROM outbox
            WHERE sent_at IS NULL
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(tx.conn())
        .await?;

        rows.into_iter()
            .map(|row| -> tx_store::Result<OutboxEntry> {
                let id: i64 = row.try_get("id")?;
                Ok(OutboxEntry {
                    id: id.to_string(),
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    headers: decode_headers(id, row.try_get("headers")?),
                })
            })
            .collect()
    }

    async fn mark_sent_tx(&self, tx: &mut PgTransaction, ids: &[String]) -> tx_store::Result<()> {
        // IDs are row sequence values; anything else matches no row
        let ids: Vec<i64> = ids.iter().filter_map(|id| id.parse().ok()).collect();
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE outbox SET sent_at = now() WHERE id = ANY($1)")
            .bind(ids)
            .execute(tx.conn())
            .await?;

        Ok(())
    }

    async fn pending_count_tx(&self, tx: &mut PgTransaction) -> tx_store::Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE sent_at IS NULL")
            .fetch_one(tx.conn())
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
