//! Saga orchestration over a transactional outbox.
//!
//! A saga is an ordered list of steps, each executed by a remote service and
//! optionally undone by a compensating command. The [`SagaOrchestrator`]
//! persists every execution through a [`SagaStateStore`] and talks to services
//! only through outbox messages:
//!
//! ```text
//! start_saga ──► saga.command.<service>
//!                      │
//!      saga.event.step.success ──► next step / Completed
//!      saga.event.step.failure ──► retry / saga.compensate.<service> (descending)
//!      saga.event.compensation.success ──► Compensated
//! ```
//!
//! Each handler commits its state change and outgoing messages in one
//! transaction.

pub mod compensation;
pub mod definition;
pub mod error;
pub mod execution;
pub mod messages;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod store;

pub use compensation::run_compensation;
pub use definition::{SagaDefinition, Step};
pub use error::{Result, SagaError};
pub use execution::{SagaExecution, StepExecution};
pub use messages::{
    COMPENSATION_SUCCESS_TOPIC, CompensationCommand, CompensationSucceeded, STEP_FAILURE_TOPIC,
    STEP_SUCCESS_TOPIC, StepCommand, StepFailed, StepSucceeded, command_topic, compensate_topic,
};
pub use orchestrator::SagaOrchestrator;
pub use retry::{RetryPolicy, retry_step};
pub use state::{SagaState, StepState};
pub use store::{MemorySagaStateStore, PgSagaStateStore, SagaStateStore};
