//! Static saga definitions supplied by callers.

use common::Document;
use serde::{Deserialize, Serialize};

/// One step of a saga definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Identifier of the step, unique within its saga.
    pub id: String,

    /// Service executing the command; selects the command topic.
    pub service: String,

    /// Command name sent to the service.
    pub command: String,

    /// Static input, merged over the saga context on dispatch.
    #[serde(default)]
    pub payload: Document,

    /// Command undoing this step, if it can be undone.
    #[serde(default)]
    pub compensate: Option<String>,

    /// How many times a failed step is dispatched again.
    #[serde(default)]
    pub max_retries: u32,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            command: command.into(),
            payload: Document::new(),
            compensate: None,
            max_retries: 0,
        }
    }

    pub fn with_payload(mut self, payload: Document) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_compensation(mut self, command: impl Into<String>) -> Self {
        self.compensate = Some(command.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// An ordered list of steps under a name.
///
/// The saga ID is assigned when an execution starts, so one definition can
/// be started any number of times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub name: String,
    pub steps: Vec<Step>,
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_keeps_step_order() {
        let def = SagaDefinition::new("checkout")
            .step(Step::new("reserve", "inventory", "Reserve").with_compensation("Release"))
            .step(Step::new("charge", "payment", "Charge").with_max_retries(2));

        assert_eq!(def.len(), 2);
        assert_eq!(def.steps[0].compensate.as_deref(), Some("Release"));
        assert_eq!(def.steps[1].compensate, None);
        assert_eq!(def.steps[1].max_retries, 2);
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let step: Step = serde_json::from_value(json!({
            "id": "a",
            "service": "svc",
            "command": "Do"
        }))
        .unwrap();
        assert!(step.payload.is_empty());
        assert_eq!(step.compensate, None);
        assert_eq!(step.max_retries, 0);
    }
}
