//! Compensating command emission.

use common::SagaId;
use outbox::{Engine, MessagePublisher, OutboxStore};
use tx_store::Database;

use crate::definition::SagaDefinition;
use crate::error::Result;
use crate::messages::{CompensationCommand, compensate_topic, saga_headers};

/// Schedules the undo commands for every step before `failed_index`.
///
/// Steps are visited from `failed_index - 1` down to 0 and steps without a
/// compensating command are skipped. All commands are written in one unit of
/// work. Returns how many were scheduled.
pub async fn run_compensation<D, S, P>(
    engine: &Engine<D, S, P>,
    saga_id: &SagaId,
    definition: &SagaDefinition,
    failed_index: usize,
) -> Result<usize>
where
    D: Database,
    S: OutboxStore<D::Tx>,
    P: MessagePublisher,
{
    let mut uow = engine.begin().await?;
    let mut scheduled = 0;
    let mut result = Ok(());

    for (index, step) in definition.steps.iter().enumerate().take(failed_index).rev() {
        let Some(command) = &step.compensate else {
            continue;
        };
        let body = CompensationCommand {
            saga_id: saga_id.clone(),
            step_id: step.id.clone(),
            step_index: index,
            command: Some(command.clone()),
            input: step.payload.clone(),
            output: None,
        };
        result = uow
            .publish(&compensate_topic(&step.service), &body, saga_headers(saga_id, index))
            .await;
        if result.is_err() {
            break;
        }
        scheduled += 1;
    }

    uow.finish(result).await?;
    tracing::info!(%saga_id, failed_index, scheduled, "compensation scheduled");
    Ok(scheduled)
}
