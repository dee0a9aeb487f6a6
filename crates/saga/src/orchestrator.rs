//! Saga orchestrator: drives executions from step events.

use std::collections::HashMap;
use std::sync::Arc;

use common::{Document, SagaId, merged};
use futures_util::StreamExt;
use outbox::{
    Delivery, DeliveryStream, Engine, Message, MessagePublisher, MessageSubscriber, OutboxStore, UnitOfWork,
};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tx_store::{Database, Transaction};

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::execution::{SagaExecution, StepExecution};
use crate::messages::{
    COMPENSATION_SUCCESS_TOPIC, CompensationCommand, CompensationSucceeded, STEP_FAILURE_TOPIC,
    STEP_SUCCESS_TOPIC, StepCommand, StepFailed, StepSucceeded, command_topic, compensate_topic,
    saga_headers,
};
use crate::retry::RetryPolicy;
use crate::state::{SagaState, StepState};
use crate::store::SagaStateStore;

/// What a handler did to the saga, reported after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Ignored,
    Advanced(usize),
    Completed,
    Retried(u32),
    Compensating(usize),
    StepCompensated,
    Compensated,
    Failed,
}

/// A step failure that will be retried once its backoff has passed.
struct PendingRetry {
    event: StepFailed,
    attempt: u32,
}

enum FailurePlan {
    /// Retry number `attempt`; also the attempts count the step must still have.
    Retry { attempt: u32 },
    Settle,
}

#[derive(Debug, Clone, Copy)]
enum EventKind {
    StepSuccess,
    StepFailure,
    CompensationSuccess,
}

impl EventKind {
    fn topic(self) -> &'static str {
        match self {
            EventKind::StepSuccess => STEP_SUCCESS_TOPIC,
            EventKind::StepFailure => STEP_FAILURE_TOPIC,
            EventKind::CompensationSuccess => COMPENSATION_SUCCESS_TOPIC,
        }
    }
}

/// The step being handled is the one the saga is waiting on.
fn is_active(execution: &SagaExecution, step: &StepExecution) -> bool {
    execution.state == SagaState::InProgress
        && execution.current_step == step.step_index
        && matches!(step.state, StepState::InProgress | StepState::Pending)
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Orchestrates saga executions.
///
/// Every handler runs in one unit of work: the state change and the messages
/// it produces are committed together, then relayed by the outbox dispatcher.
/// Events that no longer match the stored state (duplicates, late arrivals)
/// are logged and ignored.
pub struct SagaOrchestrator<D, S, P, St> {
    engine: Arc<Engine<D, S, P>>,
    states: St,
    retry: RetryPolicy,
    definitions: RwLock<HashMap<String, SagaDefinition>>,
}

impl<D, S, P, St> SagaOrchestrator<D, S, P, St>
where
    D: Database,
    S: OutboxStore<D::Tx>,
    P: MessagePublisher,
    St: SagaStateStore<D::Tx>,
{
    /// Creates an orchestrator with the default retry policy.
    pub fn new(engine: Arc<Engine<D, S, P>>, states: St) -> Self {
        Self {
            engine,
            states,
            retry: RetryPolicy::default(),
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn engine(&self) -> &Arc<Engine<D, S, P>> {
        &self.engine
    }

    pub fn states(&self) -> &St {
        &self.states
    }

    /// Makes a definition known by name.
    ///
    /// Retry budgets, step payloads and compensating command names of a
    /// running saga are looked up here. Sagas whose definition is unknown
    /// (started by another process) are never retried and have every
    /// completed step compensated.
    pub async fn register(&self, definition: SagaDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.name.clone(), definition);
    }

    async fn definition(&self, name: &str) -> Option<SagaDefinition> {
        self.definitions.read().await.get(name).cloned()
    }

    /// Starts a new execution of `definition` and dispatches its first step.
    ///
    /// Nothing is persisted or scheduled if any part fails.
    #[tracing::instrument(skip(self, definition, initial_context), fields(saga_name = %definition.name))]
    pub async fn start_saga(
        &self,
        definition: &SagaDefinition,
        initial_context: Document,
    ) -> Result<SagaId> {
        if definition.is_empty() {
            return Err(SagaError::EmptyDefinition(definition.name.clone()));
        }
        self.register(definition.clone()).await;

        let execution = SagaExecution::new(SagaId::new(), definition, initial_context);

        let mut uow = self.engine.begin().await?;
        let result = self.persist_and_dispatch(&mut uow, &execution).await;
        uow.finish(result).await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(saga_id = %execution.saga_id, steps = execution.steps.len(), "saga started");
        Ok(execution.saga_id)
    }

    async fn persist_and_dispatch(
        &self,
        uow: &mut UnitOfWork<'_, D::Tx, S>,
        execution: &SagaExecution,
    ) -> Result<()> {
        let saga_id = &execution.saga_id;
        self.states.save_execution(uow.tx(), execution).await?;
        self.states
            .update_saga_state(uow.tx(), saga_id, SagaState::InProgress, 0, None)
            .await?;

        let first = execution.step(0)?;
        self.dispatch_step(uow, saga_id, first, &first.input, None).await
    }

    /// Marks the step in progress and schedules its command.
    async fn dispatch_step(
        &self,
        uow: &mut UnitOfWork<'_, D::Tx, S>,
        saga_id: &SagaId,
        step: &StepExecution,
        input: &Document,
        error: Option<&str>,
    ) -> Result<()> {
        self.states
            .update_step_state(uow.tx(), saga_id, step.step_index, StepState::InProgress, None, error)
            .await?;

        let command = StepCommand {
            saga_id: saga_id.clone(),
            step_id: step.step_id.clone(),
            step_index: step.step_index,
            command: step.command.clone(),
            input: input.clone(),
        };
        uow.publish(
            &command_topic(&step.service),
            &command,
            saga_headers(saga_id, step.step_index),
        )
        .await?;

        tracing::debug!(%saga_id, step_index = step.step_index, service = %step.service, "step command scheduled");
        Ok(())
    }

    /// Records a step's output and advances or completes the saga.
    #[tracing::instrument(skip(self, output))]
    pub async fn handle_step_success(
        &self,
        saga_id: &SagaId,
        step_index: usize,
        output: Document,
    ) -> Result<()> {
        let mut uow = self.engine.begin().await?;
        let result = self
            .apply_step_success(&mut uow, saga_id, step_index, &output)
            .await;
        let transition = uow.finish(result).await?;
        self.record(saga_id, step_index, transition);
        Ok(())
    }

    async fn apply_step_success(
        &self,
        uow: &mut UnitOfWork<'_, D::Tx, S>,
        saga_id: &SagaId,
        step_index: usize,
        output: &Document,
    ) -> Result<Transition> {
        let execution = self.states.lock_execution(uow.tx(), saga_id).await?;
        let step = execution.step(step_index)?;
        if !is_active(&execution, step) {
            tracing::warn!(
                %saga_id,
                step_index,
                saga_state = %execution.state,
                step_state = %step.state,
                "ignoring stale step success"
            );
            return Ok(Transition::Ignored);
        }

        self.states
            .update_step_state(uow.tx(), saga_id, step_index, StepState::Completed, Some(output), None)
            .await?;
        let context = merged(&execution.context, output);
        self.states
            .update_saga_context(uow.tx(), saga_id, &context)
            .await?;

        if execution.is_last_step(step_index) {
            self.states
                .update_saga_state(uow.tx(), saga_id, SagaState::Completed, step_index, None)
                .await?;
            return Ok(Transition::Completed);
        }

        let next_index = step_index + 1;
        let next = execution.step(next_index)?;
        let input = match self.definition(&execution.saga_name).await {
            Some(definition) => match definition.steps.get(next_index) {
                Some(def_step) => merged(&context, &def_step.payload),
                None => context.clone(),
            },
            None => context.clone(),
        };

        self.states
            .update_step_input(uow.tx(), saga_id, next_index, &input)
            .await?;
        self.states
            .update_saga_state(uow.tx(), saga_id, SagaState::InProgress, next_index, None)
            .await?;
        self.dispatch_step(uow, saga_id, next, &input, None).await?;

        Ok(Transition::Advanced(next_index))
    }

    /// Retries the failed step if its budget allows, otherwise starts compensation.
    ///
    /// A failure reported for a step that is being compensated fails the saga.
    /// A retry waits out the backoff before returning; the event loop runs
    /// that wait in a separate task instead.
    #[tracing::instrument(skip(self))]
    pub async fn handle_step_failure(
        &self,
        saga_id: &SagaId,
        step_index: usize,
        error: &str,
    ) -> Result<()> {
        match self.plan_failure(saga_id, step_index).await? {
            FailurePlan::Retry { attempt } => {
                // No transaction is held during the backoff
                tokio::time::sleep(self.retry.backoff(attempt)).await;
                self.redispatch(saga_id, step_index, attempt, error).await
            }
            FailurePlan::Settle => self.settle_failure(saga_id, step_index, error).await,
        }
    }

    async fn redispatch(
        &self,
        saga_id: &SagaId,
        step_index: usize,
        attempt: u32,
        error: &str,
    ) -> Result<()> {
        let mut uow = self.engine.begin().await?;
        let result = self
            .apply_retry(&mut uow, saga_id, step_index, attempt, error)
            .await;
        let transition = uow.finish(result).await?;
        self.record(saga_id, step_index, transition);
        Ok(())
    }

    async fn settle_failure(&self, saga_id: &SagaId, step_index: usize, error: &str) -> Result<()> {
        let mut uow = self.engine.begin().await?;
        let result = self
            .apply_step_failure(&mut uow, saga_id, step_index, error)
            .await;
        let transition = uow.finish(result).await?;
        self.record(saga_id, step_index, transition);
        Ok(())
    }

    async fn plan_failure(&self, saga_id: &SagaId, step_index: usize) -> Result<FailurePlan> {
        let execution = self.get_execution(saga_id).await?;
        let step = execution.step(step_index)?;
        if !is_active(&execution, step) {
            return Ok(FailurePlan::Settle);
        }

        let Some(definition) = self.definition(&execution.saga_name).await else {
            return Ok(FailurePlan::Settle);
        };
        let max_retries = definition
            .steps
            .get(step_index)
            .map_or(0, |def_step| def_step.max_retries);

        // Every dispatch bumps attempts, so the next retry number equals it
        let attempt = step.attempts;
        if self.retry.allows(attempt, max_retries) {
            Ok(FailurePlan::Retry { attempt })
        } else {
            Ok(FailurePlan::Settle)
        }
    }

    async fn apply_retry(
        &self,
        uow: &mut UnitOfWork<'_, D::Tx, S>,
        saga_id: &SagaId,
        step_index: usize,
        attempt: u32,
        error: &str,
    ) -> Result<Transition> {
        let execution = self.states.lock_execution(uow.tx(), saga_id).await?;
        let step = execution.step(step_index)?;
        if !is_active(&execution, step) || step.attempts != attempt {
            tracing::warn!(%saga_id, step_index, "saga moved on during retry backoff");
            return Ok(Transition::Ignored);
        }

        self.dispatch_step(uow, saga_id, step, &step.input, Some(error))
            .await?;
        Ok(Transition::Retried(attempt))
    }

    async fn apply_step_failure(
        &self,
        uow: &mut UnitOfWork<'_, D::Tx, S>,
        saga_id: &SagaId,
        step_index: usize,
        error: &str,
    ) -> Result<Transition> {
        let execution = self.states.lock_execution(uow.tx(), saga_id).await?;
        let step = execution.step(step_index)?;

        if execution.state == SagaState::Compensating && step.state == StepState::Compensating {
            self.states
                .update_step_state(uow.tx(), saga_id, step_index, StepState::Failed, None, Some(error))
                .await?;
            let reason = format!("compensation of step '{}' failed: {error}", step.step_id);
            self.states
                .update_saga_state(
                    uow.tx(),
                    saga_id,
                    SagaState::Failed,
                    execution.current_step,
                    Some(&reason),
                )
                .await?;
            return Ok(Transition::Failed);
        }

        if !is_active(&execution, step) {
            tracing::warn!(
                %saga_id,
                step_index,
                saga_state = %execution.state,
                step_state = %step.state,
                "ignoring stale step failure"
            );
            return Ok(Transition::Ignored);
        }

        self.states
            .update_step_state(uow.tx(), saga_id, step_index, StepState::Failed, None, Some(error))
            .await?;
        self.states
            .update_saga_state(uow.tx(), saga_id, SagaState::Compensating, step_index, Some(error))
            .await?;

        let definition = self.definition(&execution.saga_name).await;
        let mut scheduled = 0;
        for done in execution.steps_to_compensate(step_index) {
            let undo = definition
                .as_ref()
                .and_then(|def| def.steps.get(done.step_index))
                .map(|def_step| def_step.compensate.clone());

            if let Some(None) = undo {
                // Nothing to undo for this step
                self.states
                    .update_step_state(uow.tx(), saga_id, done.step_index, StepState::Compensated, None, None)
                    .await?;
                continue;
            }

            self.states
                .update_step_state(uow.tx(), saga_id, done.step_index, StepState::Compensating, None, None)
                .await?;
            let command = CompensationCommand {
                saga_id: saga_id.clone(),
                step_id: done.step_id.clone(),
                step_index: done.step_index,
                command: undo.flatten(),
                input: done.input.clone(),
                output: done.output.clone(),
            };
            uow.publish(
                &compensate_topic(&done.service),
                &command,
                saga_headers(saga_id, done.step_index),
            )
            .await?;
            scheduled += 1;
        }

        if scheduled == 0 {
            self.states
                .update_saga_state(uow.tx(), saga_id, SagaState::Compensated, step_index, None)
                .await?;
            return Ok(Transition::Compensated);
        }
        Ok(Transition::Compensating(scheduled))
    }

    /// Marks a step undone and completes compensation once no undo is outstanding.
    #[tracing::instrument(skip(self))]
    pub async fn handle_compensation_success(
        &self,
        saga_id: &SagaId,
        step_index: usize,
    ) -> Result<()> {
        let mut uow = self.engine.begin().await?;
        let result = self
            .apply_compensation_success(&mut uow, saga_id, step_index)
            .await;
        let transition = uow.finish(result).await?;
        self.record(saga_id, step_index, transition);
        Ok(())
    }

    async fn apply_compensation_success(
        &self,
        uow: &mut UnitOfWork<'_, D::Tx, S>,
        saga_id: &SagaId,
        step_index: usize,
    ) -> Result<Transition> {
        let execution = self.states.lock_execution(uow.tx(), saga_id).await?;
        let step = execution.step(step_index)?;
        if execution.state != SagaState::Compensating || step.state != StepState::Compensating {
            tracing::warn!(
                %saga_id,
                step_index,
                saga_state = %execution.state,
                step_state = %step.state,
                "ignoring stale compensation success"
            );
            return Ok(Transition::Ignored);
        }

        self.states
            .update_step_state(uow.tx(), saga_id, step_index, StepState::Compensated, None, None)
            .await?;

        let outstanding = execution
            .steps
            .iter()
            .any(|s| s.step_index != step_index && s.state == StepState::Compensating);
        if outstanding {
            return Ok(Transition::StepCompensated);
        }

        self.states
            .update_saga_state(
                uow.tx(),
                saga_id,
                SagaState::Compensated,
                execution.current_step,
                None,
            )
            .await?;
        Ok(Transition::Compensated)
    }

    /// Loads an execution in a read-only transaction.
    pub async fn get_execution(&self, saga_id: &SagaId) -> Result<SagaExecution> {
        let mut tx = self.engine.database().begin().await?;
        let execution = self.states.get_execution(&mut tx, saga_id).await;
        tx.rollback().await?;
        execution
    }

    fn record(&self, saga_id: &SagaId, step_index: usize, transition: Transition) {
        match transition {
            Transition::Ignored => {}
            Transition::Advanced(next) => {
                tracing::info!(%saga_id, step_index, next_step = next, "saga advanced");
            }
            Transition::Completed => {
                metrics::counter!("saga_completed_total").increment(1);
                tracing::info!(%saga_id, "saga completed");
            }
            Transition::Retried(attempt) => {
                metrics::counter!("saga_step_retries_total").increment(1);
                tracing::info!(%saga_id, step_index, attempt, "step retried");
            }
            Transition::Compensating(scheduled) => {
                tracing::info!(%saga_id, step_index, scheduled, "saga compensating");
            }
            Transition::StepCompensated => {
                tracing::info!(%saga_id, step_index, "step compensated");
            }
            Transition::Compensated => {
                metrics::counter!("saga_compensated_total").increment(1);
                tracing::info!(%saga_id, "saga compensated");
            }
            Transition::Failed => {
                metrics::counter!("saga_failed_total").increment(1);
                tracing::error!(%saga_id, step_index, "saga failed during compensation");
            }
        }
    }

    /// Consumes the three step-event topics until `shutdown` turns true.
    ///
    /// Each delivery is acked after its handler returns. Retryable failures
    /// are nacked for redelivery after the retry policy's base delay;
    /// undecodable or terminal ones are logged and acked. A step retry owns
    /// its failure event while it waits out the backoff in a separate task,
    /// so other sagas' failures are not held up. The event is acked once the
    /// retry commits and nacked if shutdown comes first; pending retries are
    /// drained before this returns.
    pub async fn run_event_handlers<M>(
        self: &Arc<Self>,
        subscriber: &M,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        M: MessageSubscriber,
        D: 'static,
        S: 'static,
        P: 'static,
        St: 'static,
    {
        let success = subscriber.subscribe(STEP_SUCCESS_TOPIC).await?;
        let failure = subscriber.subscribe(STEP_FAILURE_TOPIC).await?;
        let compensation = subscriber.subscribe(COMPENSATION_SUCCESS_TOPIC).await?;
        tracing::info!("Saga event handlers started");

        tokio::join!(
            self.consume(EventKind::StepSuccess, success, shutdown.clone()),
            self.consume(EventKind::StepFailure, failure, shutdown.clone()),
            self.consume(EventKind::CompensationSuccess, compensation, shutdown),
        );

        tracing::info!("Saga event handlers stopped");
        Ok(())
    }

    async fn consume(
        self: &Arc<Self>,
        kind: EventKind,
        mut deliveries: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) where
        D: 'static,
        S: 'static,
        P: 'static,
        St: 'static,
    {
        let mut retries = JoinSet::new();

        loop {
            let delivery = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                Some(_) = retries.join_next(), if !retries.is_empty() => continue,
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            match self.handle_event(kind, delivery.message()).await {
                Ok(None) => delivery.ack(),
                Ok(Some(retry)) => {
                    let orchestrator = Arc::clone(self);
                    let shutdown = shutdown.clone();
                    retries.spawn(orchestrator.retry_delivery(retry, delivery, shutdown));
                }
                Err(e) => self.settle_error(kind, e, delivery).await,
            }
        }

        if !retries.is_empty() {
            tracing::info!(pending = retries.len(), "waiting for step retries to settle");
        }
        while retries.join_next().await.is_some() {}
    }

    async fn settle_error(&self, kind: EventKind, error: SagaError, delivery: Delivery) {
        if error.is_retryable() {
            tracing::warn!(topic = kind.topic(), %error, "event handling failed, redelivering");
            tokio::time::sleep(self.retry.base_delay).await;
            delivery.nack();
        } else {
            tracing::error!(topic = kind.topic(), %error, "event dropped");
            delivery.ack();
        }
    }

    /// Handles one event. A planned step retry is handed back to the caller
    /// instead of being applied.
    async fn handle_event(&self, kind: EventKind, message: &Message) -> Result<Option<PendingRetry>> {
        match kind {
            EventKind::StepSuccess => {
                let event: StepSucceeded = message.decode()?;
                self.handle_step_success(
                    &event.saga_id,
                    event.step_index,
                    event.output.unwrap_or_default(),
                )
                .await?;
                Ok(None)
            }
            EventKind::StepFailure => {
                let event: StepFailed = message.decode()?;
                match self.plan_failure(&event.saga_id, event.step_index).await? {
                    FailurePlan::Retry { attempt } => Ok(Some(PendingRetry { event, attempt })),
                    FailurePlan::Settle => {
                        self.settle_failure(&event.saga_id, event.step_index, &event.error)
                            .await?;
                        Ok(None)
                    }
                }
            }
            EventKind::CompensationSuccess => {
                let event: CompensationSucceeded = message.decode()?;
                self.handle_compensation_success(&event.saga_id, event.step_index)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Waits out a retry's backoff, redispatches the step and settles the
    /// failure event that asked for it.
    async fn retry_delivery(
        self: Arc<Self>,
        retry: PendingRetry,
        delivery: Delivery,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let PendingRetry { event, attempt } = retry;
        let StepFailed { saga_id, step_index, error } = event;

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                tracing::info!(%saga_id, step_index, attempt, "shutdown during retry backoff, returning failure event");
                delivery.nack();
                return;
            }
            () = tokio::time::sleep(self.retry.backoff(attempt)) => {}
        }

        match self.redispatch(&saga_id, step_index, attempt, &error).await {
            Ok(()) => delivery.ack(),
            Err(e) => {
                tracing::error!(%saga_id, step_index, attempt, error = %e, "step retry failed");
                self.settle_error(EventKind::StepFailure, e, delivery).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Step;
    use crate::store::MemorySagaStateStore;
    use outbox::{InMemoryBroker, MemoryOutboxStore, OutboxEntry};
    use serde_json::json;
    use std::time::Duration;
    use tx_store::MemoryDatabase;

    type TestOrchestrator =
        SagaOrchestrator<MemoryDatabase, MemoryOutboxStore, InMemoryBroker, MemorySagaStateStore>;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    fn orchestrator() -> TestOrchestrator {
        let engine = Arc::new(Engine::new(
            MemoryDatabase::new(),
            MemoryOutboxStore::new(),
            InMemoryBroker::new(),
        ));
        SagaOrchestrator::new(engine, MemorySagaStateStore::new())
            .with_retry_policy(RetryPolicy::new(Duration::ZERO))
    }

    fn three_steps() -> SagaDefinition {
        SagaDefinition::new("checkout")
            .step(Step::new("reserve", "inventory", "Reserve").with_compensation("Release"))
            .step(Step::new("charge", "payment", "Charge").with_compensation("Refund"))
            .step(Step::new("ship", "shipping", "Ship"))
    }

    async fn outbox(orch: &TestOrchestrator) -> Vec<OutboxEntry> {
        let tx = orch.engine().database().begin().await.unwrap();
        MemoryOutboxStore::all_entries(&tx)
            .unwrap()
            .into_iter()
            .map(|(entry, _)| entry)
            .collect()
    }

    fn topics(entries: &[OutboxEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.topic.as_str()).collect()
    }

    #[tokio::test]
    async fn start_persists_and_schedules_first_command() {
        let orch = orchestrator();
        let saga_id = orch
            .start_saga(&three_steps(), doc(json!({"order": 7})))
            .await
            .unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::InProgress);
        assert_eq!(exec.current_step, 0);
        assert_eq!(exec.steps.len(), 3);
        assert_eq!(exec.steps[0].state, StepState::InProgress);
        assert_eq!(exec.steps[0].attempts, 1);
        assert_eq!(exec.steps[1].state, StepState::Pending);

        let entries = outbox(&orch).await;
        assert_eq!(topics(&entries), vec!["saga.command.inventory"]);
        assert_eq!(entries[0].headers.get("saga_id"), Some(&saga_id.to_string()));
        assert_eq!(entries[0].headers.get("step_index").map(String::as_str), Some("0"));
        let command: StepCommand = serde_json::from_slice(&entries[0].payload).unwrap();
        assert_eq!(command.command, "Reserve");
        assert_eq!(command.input, doc(json!({"order": 7})));
    }

    #[tokio::test]
    async fn empty_definition_is_rejected() {
        let orch = orchestrator();
        let err = orch
            .start_saga(&SagaDefinition::new("nothing"), Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::EmptyDefinition(_)));
        assert!(outbox(&orch).await.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind() {
        let orch = orchestrator();
        orch.engine().database().fail_next_commits(1);

        let result = orch.start_saga(&three_steps(), Document::new()).await;
        assert!(matches!(result, Err(SagaError::Store(_))));

        let tables = orch.engine().database().snapshot().await;
        assert!(tables.is_empty("outbox"));
        assert!(tables.is_empty("saga_executions"));
        assert!(tables.is_empty("saga_step_executions"));
    }

    #[tokio::test]
    async fn two_step_saga_threads_context_through_inputs() {
        let orch = orchestrator();
        let def = SagaDefinition::new("pair")
            .step(Step::new("a", "svc-a", "A"))
            .step(Step::new("b", "svc-b", "B"));
        let saga_id = orch.start_saga(&def, doc(json!({"x": 1}))).await.unwrap();

        orch.handle_step_success(&saga_id, 0, doc(json!({"y": 2})))
            .await
            .unwrap();
        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.current_step, 1);
        assert_eq!(exec.steps[0].state, StepState::Completed);
        assert_eq!(exec.steps[1].input, doc(json!({"x": 1, "y": 2})));

        orch.handle_step_success(&saga_id, 1, doc(json!({"z": 3})))
            .await
            .unwrap();
        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Completed);
        assert_eq!(exec.context, doc(json!({"x": 1, "y": 2, "z": 3})));
        assert!(exec.steps.iter().all(|s| s.state == StepState::Completed));
        assert!(exec.steps.iter().all(|s| s.completed_at.is_some()));
    }

    #[tokio::test]
    async fn later_outputs_overwrite_context_and_payload_wins_over_context() {
        let orch = orchestrator();
        let def = SagaDefinition::new("overlay")
            .step(Step::new("a", "svc", "A"))
            .step(Step::new("b", "svc", "B").with_payload(doc(json!({"mode": "fast"}))))
            .step(Step::new("c", "svc", "C"));
        let saga_id = orch.start_saga(&def, doc(json!({"k": 0}))).await.unwrap();

        orch.handle_step_success(&saga_id, 0, doc(json!({"k": 1, "mode": "slow"})))
            .await
            .unwrap();
        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.steps[1].input, doc(json!({"k": 1, "mode": "fast"})));

        orch.handle_step_success(&saga_id, 1, doc(json!({"k": 2})))
            .await
            .unwrap();
        orch.handle_step_success(&saga_id, 2, Document::new())
            .await
            .unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Completed);
        assert_eq!(exec.context, doc(json!({"k": 2, "mode": "slow"})));
        assert_eq!(
            topics(&outbox(&orch).await),
            vec!["saga.command.svc", "saga.command.svc", "saga.command.svc"]
        );
    }

    #[tokio::test]
    async fn failure_compensates_completed_steps_in_reverse() {
        let orch = orchestrator();
        let saga_id = orch.start_saga(&three_steps(), Document::new()).await.unwrap();
        orch.handle_step_success(&saga_id, 0, doc(json!({"reservation": "r-1"})))
            .await
            .unwrap();
        orch.handle_step_success(&saga_id, 1, doc(json!({"payment": "p-1"})))
            .await
            .unwrap();

        orch.handle_step_failure(&saga_id, 2, "no courier")
            .await
            .unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Compensating);
        assert_eq!(exec.error_message.as_deref(), Some("no courier"));
        assert_eq!(exec.steps[2].state, StepState::Failed);
        assert_eq!(exec.steps[1].state, StepState::Compensating);
        assert_eq!(exec.steps[0].state, StepState::Compensating);

        let entries = outbox(&orch).await;
        let undo: Vec<_> = entries
            .iter()
            .filter(|e| e.topic.starts_with("saga.compensate."))
            .collect();
        assert_eq!(undo.len(), 2);
        assert_eq!(undo[0].topic, "saga.compensate.payment");
        assert_eq!(undo[1].topic, "saga.compensate.inventory");
        let refund: CompensationCommand = serde_json::from_slice(&undo[0].payload).unwrap();
        assert_eq!(refund.command.as_deref(), Some("Refund"));
        assert_eq!(refund.output, Some(doc(json!({"payment": "p-1"}))));

        orch.handle_compensation_success(&saga_id, 1).await.unwrap();
        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Compensating);

        orch.handle_compensation_success(&saga_id, 0).await.unwrap();
        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Compensated);
        assert_eq!(exec.steps[0].state, StepState::Compensated);
        assert_eq!(exec.steps[1].state, StepState::Compensated);
    }

    #[tokio::test]
    async fn first_step_failure_compensates_immediately() {
        let orch = orchestrator();
        let saga_id = orch.start_saga(&three_steps(), Document::new()).await.unwrap();

        orch.handle_step_failure(&saga_id, 0, "out of stock")
            .await
            .unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Compensated);
        assert_eq!(exec.steps[0].state, StepState::Failed);
        assert_eq!(exec.steps[1].state, StepState::Pending);
        assert_eq!(topics(&outbox(&orch).await), vec!["saga.command.inventory"]);
    }

    #[tokio::test]
    async fn steps_without_undo_are_compensated_in_place() {
        let orch = orchestrator();
        let def = SagaDefinition::new("audit")
            .step(Step::new("log", "audit", "Log"))
            .step(Step::new("charge", "payment", "Charge"));
        let saga_id = orch.start_saga(&def, Document::new()).await.unwrap();
        orch.handle_step_success(&saga_id, 0, Document::new())
            .await
            .unwrap();

        orch.handle_step_failure(&saga_id, 1, "declined").await.unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Compensated);
        assert_eq!(exec.steps[0].state, StepState::Compensated);
        assert!(
            outbox(&orch)
                .await
                .iter()
                .all(|e| !e.topic.starts_with("saga.compensate."))
        );
    }

    #[tokio::test]
    async fn failed_undo_fails_the_saga() {
        let orch = orchestrator();
        let saga_id = orch.start_saga(&three_steps(), Document::new()).await.unwrap();
        orch.handle_step_success(&saga_id, 0, Document::new())
            .await
            .unwrap();
        orch.handle_step_failure(&saga_id, 1, "declined").await.unwrap();

        orch.handle_step_failure(&saga_id, 0, "release refused")
            .await
            .unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Failed);
        assert_eq!(exec.steps[0].state, StepState::Failed);
        assert!(exec.error_message.unwrap().contains("release refused"));
    }

    #[tokio::test]
    async fn failed_step_is_retried_within_budget() {
        let orch = orchestrator();
        let def = SagaDefinition::new("flaky")
            .step(Step::new("call", "remote", "Call").with_max_retries(1));
        let saga_id = orch.start_saga(&def, doc(json!({"n": 1}))).await.unwrap();

        orch.handle_step_failure(&saga_id, 0, "timeout").await.unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::InProgress);
        assert_eq!(exec.steps[0].state, StepState::InProgress);
        assert_eq!(exec.steps[0].attempts, 2);
        assert_eq!(exec.steps[0].error_message.as_deref(), Some("timeout"));

        let entries = outbox(&orch).await;
        assert_eq!(topics(&entries), vec!["saga.command.remote", "saga.command.remote"]);
        let retried: StepCommand = serde_json::from_slice(&entries[1].payload).unwrap();
        assert_eq!(retried.input, doc(json!({"n": 1})));

        // Budget spent: the next failure compensates
        orch.handle_step_failure(&saga_id, 0, "timeout").await.unwrap();
        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::Compensated);
        assert_eq!(exec.steps[0].state, StepState::Failed);
    }

    fn shared(base_delay: Duration) -> Arc<TestOrchestrator> {
        let engine = Arc::new(Engine::new(
            MemoryDatabase::new(),
            MemoryOutboxStore::new(),
            InMemoryBroker::new(),
        ));
        Arc::new(
            SagaOrchestrator::new(engine, MemorySagaStateStore::new())
                .with_retry_policy(RetryPolicy::new(base_delay)),
        )
    }

    async fn send_event<T: serde::Serialize>(orch: &TestOrchestrator, topic: &str, event: &T) {
        orch.engine()
            .publisher()
            .publish(topic, Message::json(event).unwrap())
            .await
            .unwrap();
    }

    fn spawn_handlers(
        orch: &Arc<TestOrchestrator>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
        let (stop, shutdown) = watch::channel(false);
        let orch = Arc::clone(orch);
        let handle = tokio::spawn(async move {
            let broker = orch.engine().publisher().clone();
            orch.run_event_handlers(&broker, shutdown).await
        });
        (stop, handle)
    }

    async fn wait_until(
        orch: &TestOrchestrator,
        saga_id: &SagaId,
        done: impl Fn(&SagaExecution) -> bool,
    ) -> SagaExecution {
        for _ in 0..400 {
            let exec = orch.get_execution(saga_id).await.unwrap();
            if done(&exec) {
                return exec;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("saga {saga_id} never reached the expected state");
    }

    #[tokio::test]
    async fn retry_backoff_does_not_hold_up_other_sagas() {
        let orch = shared(Duration::from_secs(5));
        let flaky = SagaDefinition::new("flaky")
            .step(Step::new("call", "remote", "Call").with_max_retries(1));
        let strict = SagaDefinition::new("strict").step(Step::new("call", "remote", "Call"));
        let backing_off = orch.start_saga(&flaky, Document::new()).await.unwrap();
        let settling = orch.start_saga(&strict, Document::new()).await.unwrap();

        for saga_id in [&backing_off, &settling] {
            let event = StepFailed {
                saga_id: saga_id.clone(),
                step_index: 0,
                error: "timeout".to_string(),
            };
            send_event(&orch, STEP_FAILURE_TOPIC, &event).await;
        }
        let (stop, handlers) = spawn_handlers(&orch);

        let exec = wait_until(&orch, &settling, |e| e.state == SagaState::Compensated).await;
        assert_eq!(exec.steps[0].state, StepState::Failed);

        // Still inside its five second backoff
        let exec = orch.get_execution(&backing_off).await.unwrap();
        assert_eq!(exec.state, SagaState::InProgress);
        assert_eq!(exec.steps[0].attempts, 1);

        stop.send(true).unwrap();
        handlers.await.unwrap().unwrap();
    }

    /// Feeds fixed step-failure events and records which ones are nacked.
    #[derive(Default)]
    struct ScriptedFailures {
        events: std::sync::Mutex<Vec<Message>>,
        nacked: Arc<std::sync::Mutex<Vec<Message>>>,
    }

    #[async_trait::async_trait]
    impl MessageSubscriber for ScriptedFailures {
        async fn subscribe(&self, topic: &str) -> std::result::Result<DeliveryStream, outbox::BusError> {
            use futures_util::stream;

            if topic != STEP_FAILURE_TOPIC {
                return Ok(Box::pin(stream::pending::<Delivery>()));
            }
            let events = std::mem::take(&mut *self.events.lock().unwrap());
            let deliveries: Vec<Delivery> = events
                .into_iter()
                .map(|message| {
                    let nacked = Arc::clone(&self.nacked);
                    Delivery::new(topic, message, move |m| nacked.lock().unwrap().push(m))
                })
                .collect();
            Ok(Box::pin(stream::iter(deliveries).chain(stream::pending())))
        }
    }

    async fn flaky_saga_with_failure(
        orch: &TestOrchestrator,
    ) -> (SagaId, ScriptedFailures) {
        let flaky = SagaDefinition::new("flaky")
            .step(Step::new("call", "remote", "Call").with_max_retries(1));
        orch.register(flaky.clone()).await;
        let saga_id = orch.start_saga(&flaky, Document::new()).await.unwrap();

        let event = StepFailed {
            saga_id: saga_id.clone(),
            step_index: 0,
            error: "timeout".to_string(),
        };
        let failures = ScriptedFailures::default();
        failures.events.lock().unwrap().push(Message::json(&event).unwrap());
        (saga_id, failures)
    }

    #[tokio::test]
    async fn shutdown_during_backoff_returns_the_failure_event() {
        let orch = shared(Duration::from_secs(5));
        let (saga_id, failures) = flaky_saga_with_failure(&orch).await;
        let nacked = Arc::clone(&failures.nacked);

        let (stop, shutdown) = watch::channel(false);
        let handlers = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run_event_handlers(&failures, shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handlers)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let nacked = nacked.lock().unwrap();
        assert_eq!(nacked.len(), 1);
        let returned: StepFailed = nacked[0].decode().unwrap();
        assert_eq!(returned.saga_id, saga_id);

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::InProgress);
        assert_eq!(exec.steps[0].attempts, 1);
    }

    #[tokio::test]
    async fn committed_retry_settles_its_failure_event() {
        let orch = shared(Duration::from_millis(20));
        let (saga_id, failures) = flaky_saga_with_failure(&orch).await;
        let nacked = Arc::clone(&failures.nacked);

        let (stop, shutdown) = watch::channel(false);
        let handlers = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run_event_handlers(&failures, shutdown).await })
        };

        let exec = wait_until(&orch, &saga_id, |e| e.steps[0].attempts == 2).await;
        assert_eq!(exec.state, SagaState::InProgress);
        assert_eq!(exec.steps[0].state, StepState::InProgress);

        stop.send(true).unwrap();
        handlers.await.unwrap().unwrap();
        assert!(nacked.lock().unwrap().is_empty());
        assert_eq!(topics(&outbox(&orch).await), vec!["saga.command.remote"; 2]);
    }

    #[tokio::test]
    async fn retryable_errors_are_redelivered_after_a_pause() {
        let orch = shared(Duration::from_millis(300));
        let saga_id = orch.start_saga(&three_steps(), Document::new()).await.unwrap();
        orch.engine().database().fail_next_commits(1);

        let event = StepSucceeded {
            saga_id: saga_id.clone(),
            step_index: 0,
            output: Some(doc(json!({"a": 1}))),
        };
        send_event(&orch, STEP_SUCCESS_TOPIC, &event).await;
        let (stop, handlers) = spawn_handlers(&orch);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.current_step, 0);
        assert_eq!(exec.steps[0].state, StepState::InProgress);

        let exec = wait_until(&orch, &saga_id, |e| e.current_step == 1).await;
        assert_eq!(exec.steps[0].state, StepState::Completed);
        assert_eq!(exec.context, doc(json!({"a": 1})));

        stop.send(true).unwrap();
        handlers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let orch = orchestrator();
        let saga_id = orch.start_saga(&three_steps(), Document::new()).await.unwrap();
        orch.handle_step_success(&saga_id, 0, doc(json!({"a": 1})))
            .await
            .unwrap();

        // Duplicate success for a finished step and an early one for a later step
        orch.handle_step_success(&saga_id, 0, doc(json!({"a": 2})))
            .await
            .unwrap();
        orch.handle_step_success(&saga_id, 2, Document::new())
            .await
            .unwrap();
        orch.handle_compensation_success(&saga_id, 0).await.unwrap();
        orch.handle_step_failure(&saga_id, 0, "late").await.unwrap();

        let exec = orch.get_execution(&saga_id).await.unwrap();
        assert_eq!(exec.state, SagaState::InProgress);
        assert_eq!(exec.current_step, 1);
        assert_eq!(exec.context, doc(json!({"a": 1})));
        assert_eq!(exec.steps[0].state, StepState::Completed);
        assert_eq!(outbox(&orch).await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_saga_and_step_are_distinct_errors() {
        let orch = orchestrator();
        let err = orch
            .handle_step_success(&SagaId::from("missing"), 0, Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::NotFound(_)));

        let saga_id = orch.start_saga(&three_steps(), Document::new()).await.unwrap();
        let err = orch
            .handle_step_failure(&saga_id, 9, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::StepOutOfRange { step_index: 9, .. }));
    }

    #[tokio::test]
    async fn unknown_definition_compensates_every_completed_step() {
        let orch = orchestrator();
        let saga_id = orch.start_saga(&three_steps(), Document::new()).await.unwrap();
        orch.handle_step_success(&saga_id, 0, Document::new())
            .await
            .unwrap();

        // A second process sharing the database but not the registry
        let other = SagaOrchestrator::new(Arc::clone(orch.engine()), MemorySagaStateStore::new());
        other.handle_step_failure(&saga_id, 1, "declined").await.unwrap();

        let entries = outbox(&orch).await;
        let undo: CompensationCommand = serde_json::from_slice(&entries[2].payload).unwrap();
        assert_eq!(entries[2].topic, "saga.compensate.inventory");
        assert_eq!(undo.command, None);
        assert_eq!(
            other.get_execution(&saga_id).await.unwrap().state,
            SagaState::Compensating
        );
    }
}
