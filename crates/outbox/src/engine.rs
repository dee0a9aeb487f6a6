use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tx_store::{Database, PgDatabase, StoreError};

use crate::uow::{UnitOfWork, run_in_tx};
use crate::{
    Dispatcher, DispatcherConfig, MessagePublisher, Metadata, OutboxStore, PgOutboxStore, Result,
};

/// The database, outbox store and bus publisher used by one process.
///
/// Built once at startup and shared (behind an `Arc`) by the dispatcher and
/// every orchestrator handler.
pub struct Engine<D, S, P> {
    database: D,
    store: S,
    publisher: P,
}

impl<D, S, P> Engine<D, S, P>
where
    D: Database,
    S: OutboxStore<D::Tx>,
    P: MessagePublisher,
{
    pub fn new(database: D, store: S, publisher: P) -> Self {
        Self {
            database,
            store,
            publisher,
        }
    }

    pub fn database(&self) -> &D {
        &self.database
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Opens a unit of work bound to this engine's outbox.
    pub async fn begin(&self) -> std::result::Result<UnitOfWork<'_, D::Tx, S>, StoreError> {
        UnitOfWork::begin(&self.database, &self.store).await
    }

    /// Runs `f` inside one unit of work. See [`run_in_tx`].
    pub async fn run_in_tx<'s, T, E, F>(&'s self, f: F) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
        F: for<'u> FnOnce(
            &'u mut UnitOfWork<'s, D::Tx, S>,
        ) -> BoxFuture<'u, std::result::Result<T, E>>,
    {
        run_in_tx(&self.database, &self.store, f).await
    }

    /// Schedules a single message in its own transaction.
    pub async fn publish<T>(&self, topic: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish_with_meta(topic, payload, Metadata::new()).await
    }

    /// Schedules a single message with headers in its own transaction.
    pub async fn publish_with_meta<T>(
        &self,
        topic: &str,
        payload: &T,
        metadata: Metadata,
    ) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let mut uow = self.begin().await?;
        let result = uow.publish(topic, payload, metadata).await;
        uow.finish(result).await
    }

    /// Creates a dispatcher relaying this engine's outbox to its publisher.
    pub fn dispatcher(self: &Arc<Self>, config: DispatcherConfig) -> Dispatcher<D, S, P> {
        Dispatcher::new(Arc::clone(self), config)
    }
}

impl<P: MessagePublisher> Engine<PgDatabase, PgOutboxStore, P> {
    /// Connects to PostgreSQL, applies the migrations and builds the engine.
    pub async fn init(database_url: &str, max_connections: u32, publisher: P) -> Result<Self> {
        let database = PgDatabase::connect(database_url, max_connections).await?;
        database.run_migrations().await?;
        tracing::info!("Outbox engine initialized");
        Ok(Self::new(database, PgOutboxStore::new(), publisher))
    }
}
