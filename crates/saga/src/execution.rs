//! Persisted execution records.

use chrono::{DateTime, Utc};
use common::{Document, SagaId, merged};
use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::state::{SagaState, StepState};

/// Execution state of one step, keyed by `(saga_id, step_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub step_index: usize,
    pub state: StepState,
    pub service: String,
    pub command: String,

    /// Saga context merged with the step payload when the step was dispatched.
    pub input: Document,

    /// Output reported by the service on success.
    pub output: Option<Document>,

    pub error_message: Option<String>,

    /// Incremented on every state update.
    pub attempts: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Execution state of one saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub saga_id: SagaId,
    pub saga_name: String,
    pub state: SagaState,
    pub current_step: usize,

    /// Steps ordered by index.
    pub steps: Vec<StepExecution>,

    /// Outputs accumulated across steps, later steps overwriting earlier keys.
    pub context: Document,

    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaExecution {
    /// Builds a `Created` execution for `definition`.
    ///
    /// Each step's input is `initial_context` overlaid with the step payload.
    pub fn new(saga_id: SagaId, definition: &SagaDefinition, initial_context: Document) -> Self {
        let now = Utc::now();
        let steps = definition
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepExecution {
                step_id: step.id.clone(),
                step_index: index,
                state: StepState::Pending,
                service: step.service.clone(),
                command: step.command.clone(),
                input: merged(&initial_context, &step.payload),
                output: None,
                error_message: None,
                attempts: 0,
                started_at: None,
                completed_at: None,
            })
            .collect();

        Self {
            saga_id,
            saga_name: definition.name.clone(),
            state: SagaState::Created,
            current_step: 0,
            steps,
            context: initial_context,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the step at `step_index`.
    pub fn step(&self, step_index: usize) -> Result<&StepExecution> {
        self.steps
            .get(step_index)
            .ok_or_else(|| SagaError::StepOutOfRange {
                saga_id: self.saga_id.clone(),
                step_index,
            })
    }

    pub fn is_last_step(&self, step_index: usize) -> bool {
        step_index + 1 == self.steps.len()
    }

    /// Completed steps before `failed_index`, nearest first.
    pub fn steps_to_compensate(&self, failed_index: usize) -> impl Iterator<Item = &StepExecution> {
        self.steps
            .iter()
            .take(failed_index)
            .rev()
            .filter(|step| step.state == StepState::Completed)
    }
}
