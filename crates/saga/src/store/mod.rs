//! Persistence for saga and step execution state.

mod memory;
mod postgres;

pub use memory::MemorySagaStateStore;
pub use postgres::PgSagaStateStore;

use async_trait::async_trait;
use common::{Document, SagaId};

use crate::error::Result;
use crate::execution::SagaExecution;
use crate::state::{SagaState, StepState};

/// Saga state persistence.
///
/// Every method works inside the caller's transaction and never commits, so
/// state changes land atomically with the outbox messages they produce.
/// Updates addressing a saga that does not exist fail with
/// [`SagaError::NotFound`](crate::SagaError::NotFound); updates addressing a
/// missing step fail with
/// [`SagaError::StepOutOfRange`](crate::SagaError::StepOutOfRange).
#[async_trait]
pub trait SagaStateStore<Tx: Send>: Send + Sync {
    /// Upserts the saga row and every step row.
    async fn save_execution(&self, tx: &mut Tx, execution: &SagaExecution) -> Result<()>;

    /// Loads a saga with its steps ordered by index.
    async fn get_execution(&self, tx: &mut Tx, saga_id: &SagaId) -> Result<SagaExecution>;

    /// Loads a saga like [`get_execution`](Self::get_execution) and holds a
    /// write lock on its row until `tx` ends.
    ///
    /// Handlers read through this so that events for the same saga apply one
    /// after the other, each seeing the state the previous one committed.
    async fn lock_execution(&self, tx: &mut Tx, saga_id: &SagaId) -> Result<SagaExecution>;

    /// Sets a step's state and increments its attempts.
    ///
    /// `output` and `error` leave the stored values untouched when `None`.
    /// Entering `InProgress` stamps `started_at` once; a terminal state stamps
    /// `completed_at`.
    async fn update_step_state(
        &self,
        tx: &mut Tx,
        saga_id: &SagaId,
        step_index: usize,
        state: StepState,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Sets the saga's state and current step. Steps are not touched.
    ///
    /// `error` leaves the stored message untouched when `None`.
    async fn update_saga_state(
        &self,
        tx: &mut Tx,
        saga_id: &SagaId,
        state: SagaState,
        current_step: usize,
        error: Option<&str>,
    ) -> Result<()>;

    /// Replaces the saga's accumulated context.
    async fn update_saga_context(
        &self,
        tx: &mut Tx,
        saga_id: &SagaId,
        context: &Document,
    ) -> Result<()>;

    /// Replaces a step's input.
    async fn update_step_input(
        &self,
        tx: &mut Tx,
        saga_id: &SagaId,
        step_index: usize,
        input: &Document,
    ) -> Result<()>;
}
