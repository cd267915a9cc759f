use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flow::Flow;
use crate::step::Phase;

/// One captured step-level failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub action: String,
    pub phase: Phase,
    pub error: String,
}

/// Saved handler outputs for one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutputs {
    pub invoke: Option<serde_json::Value>,
    pub compensate: Option<serde_json::Value>,
}

impl StepOutputs {
    /// Record an output for a phase.
    pub fn record(&mut self, phase: Phase, value: serde_json::Value) {
        match phase {
            Phase::Invoke => self.invoke = Some(value),
            Phase::Compensate => self.compensate = Some(value),
        }
    }

    /// Saved output for a phase.
    pub fn get(&self, phase: Phase) -> Option<&serde_json::Value> {
        match phase {
            Phase::Invoke => self.invoke.as_ref(),
            Phase::Compensate => self.compensate.as_ref(),
        }
    }
}

/// Durable snapshot of one transaction: the flow, its captured errors, and
/// the per-action handler outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flow: Flow,
    pub errors: Vec<StepError>,
    pub context: HashMap<String, StepOutputs>,
}

impl Checkpoint {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            errors: Vec::new(),
            context: HashMap::new(),
        }
    }

    /// Storage key for this checkpoint.
    pub fn key(&self) -> String {
        checkpoint_key(&self.flow.model_id, &self.flow.transaction_id)
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the wire form.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Storage key for a transaction's checkpoint.
pub fn checkpoint_key(model_id: &str, transaction_id: &str) -> String {
    format!("{model_id}:{transaction_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{StepDefinition, StepPolicy};
    use crate::flow::FlowState;
    use crate::step::{Step, StepState, StepStatus, ROOT_ID};

    fn checkpoint() -> Checkpoint {
        let mut steps = HashMap::new();
        steps.insert(
            ROOT_ID.to_string(),
            Step::new(ROOT_ID, "", 0, vec!["_root.a".into()], StepPolicy::default()),
        );
        let mut a = Step::new("_root.a", "a", 1, vec![], StepPolicy::default());
        a.set_state(Phase::Invoke, StepState::Invoking).unwrap();
        a.set_status(Phase::Invoke, StepStatus::Waiting).unwrap();
        a.attempts = 2;
        a.failures = 1;
        steps.insert("_root.a".to_string(), a);

        let mut flow = Flow::new(
            "orders",
            "tx-9",
            StepDefinition::root(vec![StepDefinition::action("a")]),
            serde_json::json!({"sku": "x"}),
            steps,
        );
        flow.state = FlowState::Invoking;

        let mut cp = Checkpoint::new(flow);
        cp.errors.push(StepError {
            action: "a".into(),
            phase: Phase::Invoke,
            error: "downstream unavailable".into(),
        });
        cp.context
            .entry("a".to_string())
            .or_default()
            .record(Phase::Invoke, serde_json::json!({"receipt": 7}));
        cp
    }

    #[test]
    fn test_key() {
        assert_eq!(checkpoint().key(), "orders:tx-9");
        assert_eq!(checkpoint_key("m", "t"), "m:t");
    }

    #[test]
    fn test_round_trip_preserves_everything() {
        let cp = checkpoint();
        let decoded = Checkpoint::decode(&cp.encode().unwrap()).unwrap();
        assert_eq!(decoded, cp);
        let a = decoded.flow.step("_root.a").unwrap();
        assert_eq!(a.invoke.state, StepState::Invoking);
        assert_eq!(a.invoke.status, StepStatus::Waiting);
        assert_eq!(a.attempts, 2);
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(
            decoded.context["a"].get(Phase::Invoke),
            Some(&serde_json::json!({"receipt": 7}))
        );
    }
}
