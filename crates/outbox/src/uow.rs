//! Unit of Work: one transaction plus the messages scheduled inside it.

use futures_util::future::BoxFuture;
use serde::Serialize;
use tx_store::{Database, StoreError, Transaction};

use crate::store::OutboxStore;
use crate::{Message, Metadata, Result};

/// A database transaction whose `publish` calls become outbox rows.
///
/// The state writes done through [`UnitOfWork::tx`] and the messages scheduled
/// with [`UnitOfWork::publish`] are committed or discarded together. Dropping
/// the unit of work without committing rolls everything back.
pub struct UnitOfWork<'s, Tx, S> {
    tx: Tx,
    store: &'s S,
}

impl<'s, Tx, S> UnitOfWork<'s, Tx, S>
where
    Tx: Transaction,
    S: OutboxStore<Tx>,
{
    /// Opens a transaction on `db` bound to the outbox `store`.
    pub async fn begin<D>(db: &D, store: &'s S) -> std::result::Result<Self, StoreError>
    where
        D: Database<Tx = Tx>,
    {
        let tx = db.begin().await?;
        Ok(Self { tx, store })
    }

    /// Returns the open transaction for state writes.
    pub fn tx(&mut self) -> &mut Tx {
        &mut self.tx
    }

    /// Schedules `payload` on `topic`.
    ///
    /// The payload is serialized as JSON and `metadata` becomes the message
    /// headers. Nothing reaches the bus until the dispatcher picks up the row
    /// after commit.
    pub async fn publish<T>(&mut self, topic: &str, payload: &T, metadata: Metadata) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let message = Message::json(payload)?.with_metadata(metadata);
        self.store.insert_tx(&mut self.tx, topic, &message).await?;
        tracing::debug!(topic, message_id = %message.uuid, "message scheduled in outbox");
        Ok(())
    }

    /// Commits the state writes and scheduled messages.
    pub async fn commit(self) -> std::result::Result<(), StoreError> {
        self.tx.commit().await
    }

    /// Discards the state writes and scheduled messages.
    pub async fn rollback(self) -> std::result::Result<(), StoreError> {
        self.tx.rollback().await
    }

    /// Commits when `result` is `Ok`, rolls back otherwise, and returns `result`.
    pub async fn finish<T, E>(self, result: std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Runs `f` inside one unit of work.
///
/// Opens a transaction, hands `f` a [`UnitOfWork`] bound to it, then commits if
/// `f` returns `Ok` and rolls back if it returns `Err`. Begin and commit
/// failures are returned through `E`.
pub async fn run_in_tx<'s, D, S, T, E, F>(db: &D, store: &'s S, f: F) -> std::result::Result<T, E>
where
    D: Database,
    S: OutboxStore<D::Tx>,
    E: From<StoreError>,
    F: for<'u> FnOnce(&'u mut UnitOfWork<'s, D::Tx, S>) -> BoxFuture<'u, std::result::Result<T, E>>,
{
    let mut uow = UnitOfWork::begin(db, store).await?;
    let result = f(&mut uow).await;
    uow.finish(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryOutboxStore, OutboxError};
    use serde_json::json;
    use tx_store::MemoryDatabase;

    fn meta(saga_id: &str) -> Metadata {
        Metadata::from([("saga_id".to_string(), saga_id.to_string())])
    }

    #[tokio::test]
    async fn successful_unit_commits_outbox_rows() {
        let db = MemoryDatabase::new();
        let store = MemoryOutboxStore::new();

        let result: std::result::Result<(), OutboxError> = run_in_tx(&db, &store, |uow| {
            Box::pin(async move {
                uow.publish("saga.command.a", &json!({"n": 1}), meta("s-1"))
                    .await?;
                uow.publish("saga.command.b", &json!({"n": 2}), Metadata::new())
                    .await?;
                Ok(())
            })
        })
        .await;
        assert!(result.is_ok());

        let mut tx = db.begin().await.unwrap();
        let pending = store.get_pending_tx(&mut tx, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].topic, "saga.command.a");
        assert_eq!(pending[0].headers.get("saga_id").unwrap(), "s-1");
        let body: serde_json::Value = serde_json::from_slice(&pending[1].payload).unwrap();
        assert_eq!(body, json!({"n": 2}));
    }

    #[tokio::test]
    async fn failing_unit_leaves_no_rows() {
        let db = MemoryDatabase::new();
        let store = MemoryOutboxStore::new();

        let result: std::result::Result<(), OutboxError> = run_in_tx(&db, &store, |uow| {
            Box::pin(async move {
                uow.tx()
                    .tables_mut()
                    .upsert("business", "k", json!({"v": 1}));
                uow.publish("topic", &json!({"n": 1}), Metadata::new())
                    .await?;
                Err(OutboxError::Bus(crate::BusError::Publish {
                    topic: "topic".into(),
                    reason: "forced".into(),
                }))
            })
        })
        .await;
        assert!(result.is_err());

        let tables = db.snapshot().await;
        assert!(tables.is_empty("outbox"));
        assert!(tables.is_empty("business"));
    }

    #[tokio::test]
    async fn commit_failure_is_returned_and_discards_rows() {
        let db = MemoryDatabase::new();
        let store = MemoryOutboxStore::new();
        db.fail_next_commits(1);

        let result: std::result::Result<(), OutboxError> = run_in_tx(&db, &store, |uow| {
            Box::pin(async move { uow.publish("topic", &json!({}), Metadata::new()).await })
        })
        .await;
        assert!(matches!(
            result,
            Err(OutboxError::Store(StoreError::CommitRejected(_)))
        ));
        assert!(db.snapshot().await.is_empty("outbox"));
    }

    #[tokio::test]
    async fn explicit_begin_and_drop_rolls_back() {
        let db = MemoryDatabase::new();
        let store = MemoryOutboxStore::new();

        {
            let mut uow = UnitOfWork::begin(&db, &store).await.unwrap();
            uow.publish("topic", &json!({}), Metadata::new())
                .await
                .unwrap();
        }
        assert!(db.snapshot().await.is_empty("outbox"));

        let mut uow = UnitOfWork::begin(&db, &store).await.unwrap();
        uow.publish("topic", &json!({}), Metadata::new())
            .await
            .unwrap();
        uow.commit().await.unwrap();
        assert_eq!(db.snapshot().await.len("outbox"), 1);
    }
}
