//! Step retry policy.

use std::time::Duration;

use common::SagaId;
use outbox::{Engine, MessagePublisher, OutboxStore};
use tx_store::Database;

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::messages::{StepCommand, command_topic, saga_headers};

/// Linear backoff between dispatches of a failed step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry; the n-th retry waits `n × base_delay`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Returns true if retry number `attempt` is within `max_retries`.
    pub fn allows(&self, attempt: u32, max_retries: u32) -> bool {
        attempt >= 1 && attempt <= max_retries
    }
}

/// Republishes a step's command after the backoff for `attempt`.
///
/// The command carries the step's static payload as its input. Fails with
/// [`SagaError::RetriesExhausted`] once `attempt` exceeds the step's budget,
/// without waiting.
pub async fn retry_step<D, S, P>(
    engine: &Engine<D, S, P>,
    policy: &RetryPolicy,
    saga_id: &SagaId,
    definition: &SagaDefinition,
    step_index: usize,
    attempt: u32,
) -> Result<()>
where
    D: Database,
    S: OutboxStore<D::Tx>,
    P: MessagePublisher,
{
    let step = definition
        .steps
        .get(step_index)
        .ok_or_else(|| SagaError::StepOutOfRange {
            saga_id: saga_id.clone(),
            step_index,
        })?;

    if attempt > step.max_retries {
        return Err(SagaError::RetriesExhausted {
            step: step.id.clone(),
            max_retries: step.max_retries,
        });
    }

    tokio::time::sleep(policy.backoff(attempt)).await;

    let command = StepCommand {
        saga_id: saga_id.clone(),
        step_id: step.id.clone(),
        step_index,
        command: step.command.clone(),
        input: step.payload.clone(),
    };
    engine
        .publish_with_meta(&command_topic(&step.service), &command, saga_headers(saga_id, step_index))
        .await?;

    metrics::counter!("saga_step_retries_total").increment(1);
    tracing::info!(%saga_id, step_index, attempt, "step command republished");
    Ok(())
}
