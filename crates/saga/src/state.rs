//! Saga and step state machines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► InProgress ──┬──► Completed
///                          └──► Compensating ──┬──► Compensated
///                                              └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Persisted but no step dispatched yet.
    #[default]
    Created,

    /// Steps are being executed.
    InProgress,

    /// Every step completed (terminal state).
    Completed,

    /// A compensating command failed (terminal state).
    Failed,

    /// A step failed and completed steps are being undone.
    Compensating,

    /// Every completed step was undone (terminal state).
    Compensated,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::Compensated
        )
    }

    /// Returns the persisted name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Created => "CREATED",
            SagaState::InProgress => "IN_PROGRESS",
            SagaState::Completed => "COMPLETED",
            SagaState::Failed => "FAILED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaState {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(SagaState::Created),
            "IN_PROGRESS" => Ok(SagaState::InProgress),
            "COMPLETED" => Ok(SagaState::Completed),
            "FAILED" => Ok(SagaState::Failed),
            "COMPENSATING" => Ok(SagaState::Compensating),
            "COMPENSATED" => Ok(SagaState::Compensated),
            other => Err(SagaError::InvalidState(format!("unknown saga state '{other}'"))),
        }
    }
}

/// The state of one step of a saga.
///
/// ```text
/// Pending ──► InProgress ──┬──► Completed ──► Compensating ──┬──► Compensated
///               ▲    │     └──► Failed                       └──► Failed
///               └────┘ retry
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl StepState {
    /// Returns true for the states that stamp `completed_at`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Compensated
        )
    }

    /// Returns the persisted name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "PENDING",
            StepState::InProgress => "IN_PROGRESS",
            StepState::Completed => "COMPLETED",
            StepState::Failed => "FAILED",
            StepState::Compensating => "COMPENSATING",
            StepState::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepState {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepState::Pending),
            "IN_PROGRESS" => Ok(StepState::InProgress),
            "COMPLETED" => Ok(StepState::Completed),
            "FAILED" => Ok(StepState::Failed),
            "COMPENSATING" => Ok(StepState::Compensating),
            "COMPENSATED" => Ok(StepState::Compensated),
            other => Err(SagaError::InvalidState(format!("unknown step state '{other}'"))),
        }
    }
}
