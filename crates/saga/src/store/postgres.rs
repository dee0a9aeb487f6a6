use async_trait::async_trait;
use common::{Document, SagaId};
use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use tx_store::PgTransaction;

use super::SagaStateStore;
use crate::error::{Result, SagaError};
use crate::execution::{SagaExecution, StepExecution};
use crate::state::{SagaState, StepState};

const SELECT_SAGA: &str = r#"
    SELECT saga_id, saga_name, state, current_step, context, error_message, created_at, updated_at
    FROM saga_executions
    WHERE saga_id = $1
"#;

// Under READ COMMITTED a waiting FOR UPDATE returns the row as the lock holder committed it
const SELECT_SAGA_FOR_UPDATE: &str = r#"
    SELECT saga_id, saga_name, state, current_step, context, error_message, created_at, updated_at
    FROM saga_executions
    WHERE saga_id = $1
    FOR UPDATE
"#;

/// PostgreSQL saga state store over `saga_executions` and `saga_step_executions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgSagaStateStore;

impl PgSagaStateStore {
    pub fn new() -> Self {
        Self
    }

    /// Creates both saga tables and their indexes if they do not exist.
    pub async fn init_schema(&self, tx: &mut PgTransaction) -> Result<()> {
        sqlx::raw_sql(include_str!("../../../../migrations/002_create_saga_tables.sql"))
            .execute(tx.conn())
            .await?;
        Ok(())
    }

    /// Distinguishes a missing saga from a missing step after an update hit no row.
    async fn missing_step(
        &self,
        tx: &mut PgTransaction,
        saga_id: &SagaId,
        step_index: usize,
    ) -> SagaError {
        let exists = sqlx::query("SELECT 1 FROM saga_executions WHERE saga_id = $1")
            .bind(saga_id.as_str())
            .fetch_optional(tx.conn())
            .await;

        match exists {
            Ok(Some(_)) => SagaError::StepOutOfRange {
                saga_id: saga_id.clone(),
                step_index,
            },
            Ok(None) => SagaError::NotFound(saga_id.clone()),
            Err(e) => e.into(),
        }
    }

    /// Reads the saga row, optionally with `FOR UPDATE`, then its steps.
    async fn load(
        &self,
        tx: &mut PgTransaction,
        saga_id: &SagaId,
        lock: bool,
    ) -> Result<SagaExecution> {
        let query = if lock { SELECT_SAGA_FOR_UPDATE } else { SELECT_SAGA };
        let row = sqlx::query(query)
            .bind(saga_id.as_str())
            .fetch_optional(tx.conn())
            .await?
            .ok_or_else(|| SagaError::NotFound(saga_id.clone()))?;

        let step_rows = sqlx::query(
            r#"
            SELECT step_id, step_index, state, service, command, input, output,
                   error_message, attempts, started_at, completed_at
            FROM saga_step_executions
            WHERE saga_id = $1
            ORDER BY step_index
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_all(tx.conn())
        .await?;

        let steps = step_rows
            .iter()
            .map(step_from_row)
            .collect::<Result<Vec<_>>>()?;
        let state: String = row.try_get("state")?;
        let saga_id: String = row.try_get("saga_id")?;

        Ok(SagaExecution {
            saga_id: SagaId::from(saga_id),
            saga_name: row.try_get("saga_name")?,
            state: state.parse::<SagaState>()?,
            current_step: from_db_int(row.try_get("current_step")?)?,
            steps,
            context: json_document(&row, "context")?.unwrap_or_default(),
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn to_db_int(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| SagaError::InvalidState(format!("{value} does not fit INT")))
}

fn from_db_int(value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| SagaError::InvalidState(format!("negative value {value}")))
}

fn json_document(row: &PgRow, column: &str) -> Result<Option<Document>> {
    let value: Option<Json<Document>> = row.try_get(column)?;
    Ok(value.map(|Json(doc)| doc))
}

fn step_from_row(row: &PgRow) -> Result<StepExecution> {
    let state: String = row.try_get("state")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(StepExecution {
        step_id: row.try_get("step_id")?,
        step_index: from_db_int(row.try_get("step_index")?)?,
        state: state.parse()?,
        service: row.try_get("service")?,
        command: row.try_get("command")?,
        input: json_document(row, "input")?.unwrap_or_default(),
        output: json_document(row, "output")?,
        error_message: row.try_get("error_message")?,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl SagaStateStore<PgTransaction> for PgSagaStateStore {
    async fn save_execution(&self, tx: &mut PgTransaction, execution: &SagaExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_executions
                (saga_id, saga_name, state, current_step, context, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (saga_id) DO UPDATE SET
                saga_name = EXCLUDED.saga_name,
                state = EXCLUDED.state,
                current_step = EXCLUDED.current_step,
                context = EXCLUDED.context,
                error_message = EXCLUDED.error_message,
                updated_at = now()
            "#,
        )
        .bind(execution.saga_id.as_str())
        .bind(&execution.saga_name)
        .bind(execution.state.as_str())
        .bind(to_db_int(execution.current_step)?)
        .bind(Json(&execution.context))
        .bind(execution.error_message.as_deref())
        .bind(execution.created_at)
        .execute(tx.conn())
        .await?;

        for step in &execution.steps {
            sqlx::query(
                r#"
                INSERT INTO saga_step_executions
                    (saga_id, step_index, step_id, state, service, command, input, output,
                     error_message, attempts, started_at, completed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (saga_id, step_index) DO UPDATE SET
                    step_id = EXCLUDED.step_id,
                    state = EXCLUDED.state,
                    service = EXCLUDED.service,
                    command = EXCLUDED.command,
                    input = EXCLUDED.input,
                    output = EXCLUDED.output,
                    error_message = EXCLUDED.error_message,
                    attempts = EXCLUDED.attempts,
                    started_at = EXCLUDED.started_at,
                    completed_at = EXCLUDED.completed_at
                "#,
            )
            .bind(execution.saga_id.as_str())
            .bind(to_db_int(step.step_index)?)
            .bind(&step.step_id)
            .bind(step.state.as_str())
            .bind(&step.service)
            .bind(&step.command)
            .bind(Json(&step.input))
            .bind(step.output.as_ref().map(Json))
            .bind(step.error_message.as_deref())
            .bind(i32::try_from(step.attempts).unwrap_or(i32::MAX))
            .bind(step.started_at)
            .bind(step.completed_at)
            .execute(tx.conn())
            .await?;
        }

        Ok(())
    }

    async fn get_execution(&self, tx: &mut PgTransaction, saga_id: &SagaId) -> Result<SagaExecution> {
        self.load(tx, saga_id, false).await
    }

    async fn lock_execution(&self, tx: &mut PgTransaction, saga_id: &SagaId) -> Result<SagaExecution> {
        self.load(tx, saga_id, true).await
    }

    async fn update_step_state(
        &self,
        tx: &mut PgTransaction,
        saga_id: &SagaId,
        step_index: usize,
        state: StepState,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE saga_step_executions SET
                state = $3,
                output = COALESCE($4, output),
                error_message = COALESCE($5, error_message),
                attempts = attempts + 1,
                started_at = CASE
                    WHEN $3 = 'IN_PROGRESS' AND started_at IS NULL THEN now()
                    ELSE started_at
                END,
                completed_at = CASE WHEN $6 THEN now() ELSE completed_at END
            WHERE saga_id = $1 AND step_index = $2
            "#,
        )
        .bind(saga_id.as_str())
        .bind(to_db_int(step_index)?)
        .bind(state.as_str())
        .bind(output.map(Json))
        .bind(error)
        .bind(state.is_terminal())
        .execute(tx.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missing_step(tx, saga_id, step_index).await);
        }
        Ok(())
    }

    async fn update_saga_state(
        &self,
        tx: &mut PgTransaction,
        saga_id: &SagaId,
        state: SagaState,
        current_step: usize,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE saga_executions SET
                state = $2,
                current_step = $3,
                error_message = COALESCE($4, error_message),
                updated_at = now()
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_str())
        .bind(state.as_str())
        .bind(to_db_int(current_step)?)
        .bind(error)
        .execute(tx.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::NotFound(saga_id.clone()));
        }
        Ok(())
    }

    async fn update_saga_context(
        &self,
        tx: &mut PgTransaction,
        saga_id: &SagaId,
        context: &Document,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE saga_executions SET context = $2, updated_at = now() WHERE saga_id = $1",
        )
        .bind(saga_id.as_str())
        .bind(Json(context))
        .execute(tx.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::NotFound(saga_id.clone()));
        }
        Ok(())
    }

    async fn update_step_input(
        &self,
        tx: &mut PgTransaction,
        saga_id: &SagaId,
        step_index: usize,
        input: &Document,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE saga_step_executions SET input = $3 WHERE saga_id = $1 AND step_index = $2",
        )
        .bind(saga_id.as_str())
        .bind(to_db_int(step_index)?)
        .bind(Json(input))
        .execute(tx.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missing_step(tx, saga_id, step_index).await);
        }
        Ok(())
    }
}
