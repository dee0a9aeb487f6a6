//! Topics, headers and message bodies exchanged with participant services.

use common::{Document, SagaId};
use outbox::Metadata;
use serde::{Deserialize, Serialize};

/// Services report a completed step here.
pub const STEP_SUCCESS_TOPIC: &str = "saga.event.step.success";

/// Services report a failed step (or a failed undo) here.
pub const STEP_FAILURE_TOPIC: &str = "saga.event.step.failure";

/// Services report a completed undo here.
pub const COMPENSATION_SUCCESS_TOPIC: &str = "saga.event.compensation.success";

pub const SAGA_ID_HEADER: &str = "saga_id";
pub const STEP_INDEX_HEADER: &str = "step_index";

/// Topic carrying step commands for `service`.
pub fn command_topic(service: &str) -> String {
    format!("saga.command.{service}")
}

/// Topic carrying compensating commands for `service`.
pub fn compensate_topic(service: &str) -> String {
    format!("saga.compensate.{service}")
}

/// Correlation headers attached to every outgoing saga message.
pub fn saga_headers(saga_id: &SagaId, step_index: usize) -> Metadata {
    Metadata::from([
        (SAGA_ID_HEADER.to_string(), saga_id.to_string()),
        (STEP_INDEX_HEADER.to_string(), step_index.to_string()),
    ])
}

/// Orders a service to execute a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommand {
    pub saga_id: SagaId,
    pub step_id: String,
    pub step_index: usize,
    pub command: String,
    pub input: Document,
}

/// Orders a service to undo a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationCommand {
    pub saga_id: SagaId,
    pub step_id: String,
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub input: Document,
    #[serde(default)]
    pub output: Option<Document>,
}

/// A step finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSucceeded {
    pub saga_id: SagaId,
    pub step_index: usize,
    #[serde(default)]
    pub output: Option<Document>,
}

/// A step (or its undo) failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailed {
    pub saga_id: SagaId,
    pub step_index: usize,
    #[serde(default)]
    pub error: String,
}

/// A step was undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSucceeded {
    pub saga_id: SagaId,
    pub step_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topics_are_derived_from_the_service() {
        assert_eq!(command_topic("payment"), "saga.command.payment");
        assert_eq!(compensate_topic("payment"), "saga.compensate.payment");
    }

    #[test]
    fn headers_carry_correlation_ids() {
        let headers = saga_headers(&SagaId::from("s-1"), 3);
        assert_eq!(headers.get("saga_id").map(String::as_str), Some("s-1"));
        assert_eq!(headers.get("step_index").map(String::as_str), Some("3"));
    }

    #[test]
    fn success_event_tolerates_missing_or_null_output() {
        let event: StepSucceeded =
            serde_json::from_value(json!({"saga_id": "s-1", "step_index": 0})).unwrap();
        assert_eq!(event.output, None);

        let event: StepSucceeded =
            serde_json::from_value(json!({"saga_id": "s-1", "step_index": 0, "output": null}))
                .unwrap();
        assert_eq!(event.output, None);
    }

    #[test]
    fn command_body_uses_snake_case_fields() {
        let cmd = StepCommand {
            saga_id: SagaId::from("s-1"),
            step_id: "a".into(),
            step_index: 0,
            command: "Do".into(),
            input: Document::new(),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"saga_id": "s-1", "step_id": "a", "step_index": 0, "command": "Do", "input": {}})
        );
    }
}
