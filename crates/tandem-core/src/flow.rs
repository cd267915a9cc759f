use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::StepDefinition;
use crate::step::Step;

/// Transaction-wide state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Flow is created but not driven yet.
    NotStarted,
    /// Forward execution in progress.
    Invoking,
    /// A fatal failure was observed; rollback starts once in-flight steps settle.
    WaitingToCompensate,
    /// Rollback in progress.
    Compensating,
    /// All steps completed forward.
    Done,
    /// Rollback completed.
    Reverted,
    /// Flow failed (permanent failure without compensation, or compensation failed).
    Failed,
}

impl FlowState {
    /// Convert to string for storage and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Invoking => "invoking",
            Self::WaitingToCompensate => "waiting_to_compensate",
            Self::Compensating => "compensating",
            Self::Done => "done",
            Self::Reverted => "reverted",
            Self::Failed => "failed",
        }
    }

    /// Whether the flow is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Reverted | Self::Failed)
    }
}

/// The DAG plus its runtime state for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Model the flow was instantiated from.
    pub model_id: String,
    /// Caller-chosen transaction id.
    pub transaction_id: String,
    /// Transaction input, the base of every step payload.
    pub input: serde_json::Value,
    /// Transaction-wide state.
    pub state: FlowState,
    pub has_skipped_steps: bool,
    pub has_failed_steps: bool,
    pub has_async_steps: bool,
    pub has_remote_steps: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// The original definition, kept for rehydration.
    pub definition: StepDefinition,
    /// Step table keyed by path id.
    pub steps: HashMap<String, Step>,
}

impl Flow {
    /// Create a fresh flow over a built step table.
    pub fn new(
        model_id: impl Into<String>,
        transaction_id: impl Into<String>,
        definition: StepDefinition,
        input: serde_json::Value,
        steps: HashMap<String, Step>,
    ) -> Self {
        let has_async_steps = definition.has_async_steps();
        let has_remote_steps = definition.has_remote_steps();
        Self {
            model_id: model_id.into(),
            transaction_id: transaction_id.into(),
            input,
            state: FlowState::NotStarted,
            has_skipped_steps: false,
            has_failed_steps: false,
            has_async_steps,
            has_remote_steps,
            cancelled_at: None,
            started_at: Some(Utc::now()),
            definition,
            steps,
        }
    }

    /// Look up a step by path id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Look up a step by path id, mutably.
    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.get_mut(id)
    }

    /// Look up a step by action name. Actions are unique within a flow.
    pub fn step_by_action(&self, action: &str) -> Option<&Step> {
        self.steps.values().find(|s| s.action == action)
    }

    /// Id of the step owning `action`, if any.
    pub fn step_id_by_action(&self, action: &str) -> Option<String> {
        self.step_by_action(action).map(|s| s.id.clone())
    }

    /// Ids of all descendants of `id`, in unspecified order.
    pub fn descendant_ids(&self, id: &str) -> Vec<String> {
        let prefix = format!("{id}.");
        self.steps
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Number of steps excluding the synthetic root.
    pub fn total_steps(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}
