//! Relays committed outbox rows to the message bus.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::watch;
use tx_store::{Database, Transaction};

use crate::{BusError, Engine, MessagePublisher, OutboxStore, Result};

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum rows fetched per batch.
    pub limit: usize,

    /// Pause after an empty or partial batch, and after a failed one.
    pub delay: Duration,

    /// End the loop on the first failed batch instead of retrying.
    pub stop_on_err: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            delay: Duration::from_secs(1),
            stop_on_err: false,
        }
    }
}

/// Result of one polling round.
#[derive(Debug)]
pub enum BatchOutcome {
    /// No pending rows.
    Empty,

    /// Every row of the batch was published and marked sent.
    Delivered(usize),

    /// A publish failed; the whole batch was rolled back.
    PublishFailed(BusError),
}

/// Background loop draining the outbox.
///
/// Only one dispatcher should run per outbox table. A crash between publishing
/// and committing redelivers the batch, so consumers must tolerate duplicates.
pub struct Dispatcher<D, S, P> {
    engine: Arc<Engine<D, S, P>>,
    config: DispatcherConfig,
}

impl<D, S, P> Dispatcher<D, S, P>
where
    D: Database,
    S: OutboxStore<D::Tx>,
    P: MessagePublisher,
{
    pub fn new(engine: Arc<Engine<D, S, P>>, config: DispatcherConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one batch: fetch, publish in order, mark sent and commit.
    ///
    /// Bus failures are reported as [`BatchOutcome::PublishFailed`] after the
    /// batch is rolled back. Persistence failures are returned as errors.
    pub async fn poll_once(&self) -> Result<BatchOutcome> {
        let store = self.engine.store();
        let mut tx = self.engine.database().begin().await?;

        let entries = store.get_pending_tx(&mut tx, self.config.limit).await?;
        if entries.is_empty() {
            tx.rollback().await?;
            return Ok(BatchOutcome::Empty);
        }
        histogram!("outbox_batch_size").record(entries.len() as f64);

        let mut ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Err(e) = self
                .engine
                .publisher()
                .publish(&entry.topic, entry.to_message())
                .await
            {
                counter!("outbox_dispatch_failures_total").increment(1);
                tracing::warn!(
                    outbox_id = %entry.id,
                    topic = %entry.topic,
                    error = %e,
                    "Publish failed, rolling back batch"
                );
                tx.rollback().await?;
                return Ok(BatchOutcome::PublishFailed(e));
            }
            ids.push(entry.id.clone());
        }

        store.mark_sent_tx(&mut tx, &ids).await?;
        tx.commit().await?;

        counter!("outbox_messages_dispatched_total").increment(ids.len() as u64);
        tracing::debug!(count = ids.len(), "Outbox batch delivered");
        Ok(BatchOutcome::Delivered(ids.len()))
    }

    /// Polls until `shutdown` turns true.
    ///
    /// Returns `Ok(())` on shutdown, the bus error of the first failed batch
    /// when `stop_on_err` is set, and any persistence error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            limit = self.config.limit,
            delay_ms = self.config.delay.as_millis() as u64,
            stop_on_err = self.config.stop_on_err,
            "Outbox dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                () = wait_for_shutdown(&mut shutdown) => break,
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(BatchOutcome::Delivered(n)) if n >= self.config.limit => continue,
                Ok(BatchOutcome::Delivered(_)) | Ok(BatchOutcome::Empty) => {}
                Ok(BatchOutcome::PublishFailed(e)) => {
                    if self.config.stop_on_err {
                        tracing::error!(error = %e, "Outbox dispatcher stopping on publish error");
                        return Err(e.into());
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Outbox dispatcher stopping on store error");
                    return Err(e);
                }
            }

            tokio::select! {
                () = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(self.config.delay) => {}
            }
        }

        tracing::info!("Outbox dispatcher stopped");
        Ok(())
    }
}
