use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Document, SagaId};
use serde::{Deserialize, Serialize};
use tx_store::{MemoryTables, MemoryTransaction};

use super::SagaStateStore;
use crate::error::{Result, SagaError};
use crate::execution::{SagaExecution, StepExecution};
use crate::state::{SagaState, StepState};

const SAGAS: &str = "saga_executions";
const STEPS: &str = "saga_step_executions";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SagaRow {
    saga_id: SagaId,
    saga_name: String,
    state: SagaState,
    current_step: usize,
    context: Document,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Step rows of one saga share this prefix. The ID length keeps an ID from
/// matching the rows of a longer ID it is a prefix of (`a` and `a/b`).
fn step_prefix(saga_id: &SagaId) -> String {
    format!("{}:{saga_id}/", saga_id.as_str().len())
}

fn step_key(saga_id: &SagaId, step_index: usize) -> String {
    format!("{}{step_index:010}", step_prefix(saga_id))
}

fn load_saga(tables: &MemoryTables, saga_id: &SagaId) -> Result<SagaRow> {
    tables
        .get_row(SAGAS, saga_id.as_str())?
        .ok_or_else(|| SagaError::NotFound(saga_id.clone()))
}

fn load_step(tables: &MemoryTables, saga_id: &SagaId, step_index: usize) -> Result<StepExecution> {
    load_saga(tables, saga_id)?;
    tables
        .get_row(STEPS, &step_key(saga_id, step_index))?
        .ok_or_else(|| SagaError::StepOutOfRange {
            saga_id: saga_id.clone(),
            step_index,
        })
}

/// In-memory saga state store for testing, backed by a [`tx_store::MemoryDatabase`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySagaStateStore;

impl MemorySagaStateStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SagaStateStore<MemoryTransaction> for MemorySagaStateStore {
    async fn save_execution(
        &self,
        tx: &mut MemoryTransaction,
        execution: &SagaExecution,
    ) -> Result<()> {
        let tables = tx.tables_mut();
        let created_at = tables
            .get_row::<SagaRow>(SAGAS, execution.saga_id.as_str())?
            .map_or(execution.created_at, |row| row.created_at);

        let row = SagaRow {
            saga_id: execution.saga_id.clone(),
            saga_name: execution.saga_name.clone(),
            state: execution.state,
            current_step: execution.current_step,
            context: execution.context.clone(),
            error_message: execution.error_message.clone(),
            created_at,
            updated_at: Utc::now(),
        };
        tables.upsert_row(SAGAS, execution.saga_id.as_str(), &row)?;

        for step in &execution.steps {
            tables.upsert_row(STEPS, step_key(&execution.saga_id, step.step_index), step)?;
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        tx: &mut MemoryTransaction,
        saga_id: &SagaId,
    ) -> Result<SagaExecution> {
        let tables = tx.tables();
        let row = load_saga(tables, saga_id)?;

        let prefix = step_prefix(saga_id);
        let steps = tables
            .rows_with_prefix(STEPS, &prefix)
            .map(|(_, value)| -> Result<StepExecution> { Ok(serde_json::from_value(value.clone())?) })
            .collect::<Result<Vec<_>>>()?;

        Ok(SagaExecution {
            saga_id: row.saga_id,
            saga_name: row.saga_name,
            state: row.state,
            current_step: row.current_step,
            steps,
            context: row.context,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn lock_execution(
        &self,
        tx: &mut MemoryTransaction,
        saga_id: &SagaId,
    ) -> Result<SagaExecution> {
        // Memory transactions are already exclusive
        self.get_execution(tx, saga_id).await
    }

    async fn update_step_state(
        &self,
        tx: &mut MemoryTransaction,
        saga_id: &SagaId,
        step_index: usize,
        state: StepState,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<()> {
        let tables = tx.tables_mut();
        let mut step = load_step(tables, saga_id, step_index)?;

        let now = Utc::now();
        step.state = state;
        if let Some(output) = output {
            step.output = Some(output.clone());
        }
        if let Some(error) = error {
            step.error_message = Some(error.to_string());
        }
        step.attempts += 1;
        if state == StepState::InProgress && step.started_at.is_none() {
            step.started_at = Some(now);
        }
        if state.is_terminal() {
            step.completed_at = Some(now);
        }

        tables.upsert_row(STEPS, step_key(saga_id, step_index), &step)?;
        Ok(())
    }

    async fn update_saga_state(
        &self,
        tx: &mut MemoryTransaction,
        saga_id: &SagaId,
        state: SagaState,
        current_step: usize,
        error: Option<&str>,
    ) -> Result<()> {
        let tables = tx.tables_mut();
        let mut row = load_saga(tables, saga_id)?;

        row.state = state;
        row.current_step = current_step;
        if let Some(error) = error {
            row.error_message = Some(error.to_string());
        }
        row.updated_at = Utc::now();

        tables.upsert_row(SAGAS, saga_id.as_str(), &row)?;
        Ok(())
    }

    async fn update_saga_context(
        &self,
        tx: &mut MemoryTransaction,
        saga_id: &SagaId,
        context: &Document,
    ) -> Result<()> {
        let tables = tx.tables_mut();
        let mut row = load_saga(tables, saga_id)?;

        row.context = context.clone();
        row.updated_at = Utc::now();

        tables.upsert_row(SAGAS, saga_id.as_str(), &row)?;
        Ok(())
    }

    async fn update_step_input(
        &self,
        tx: &mut MemoryTransaction,
        saga_id: &SagaId,
        step_index: usize,
        input: &Document,
    ) -> Result<()> {
        let tables = tx.tables_mut();
        let mut step = load_step(tables, saga_id, step_index)?;
        step.input = input.clone();
        tables.upsert_row(STEPS, step_key(saga_id, step_index), &step)?;
        Ok(())
    }
}
