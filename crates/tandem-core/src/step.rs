use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::StepPolicy;
use crate::error::{Result, SagaError};
use crate::flow::FlowState;

/// Id of the synthetic root step. The root anchors the DAG and never runs.
pub const ROOT_ID: &str = "_root";

/// Separator between path segments in step ids.
pub const ID_SEPARATOR: char = '.';

/// Execution phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Forward execution.
    Invoke,
    /// Rollback execution.
    Compensate,
}

impl Phase {
    /// Convert to the wire string used in payload metadata and keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoke => "invoke",
            Self::Compensate => "compensate",
        }
    }

    /// Parse from the wire string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoke" => Some(Self::Invoke),
            "compensate" => Some(Self::Compensate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Phase exists but is not reachable yet (compensate before rollback).
    Dormant,
    /// Phase is reachable but has not been dispatched.
    NotStarted,
    /// Forward handler dispatched.
    Invoking,
    /// Rollback handler dispatched.
    Compensating,
    /// Forward handler succeeded.
    Done,
    /// Rollback handler succeeded.
    Reverted,
    /// Phase failed permanently.
    Failed,
    /// Step was skipped because an ancestor failed with continue-on-failure.
    Skipped,
}

impl StepState {
    /// Convert to string for storage and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dormant => "dormant",
            Self::NotStarted => "not_started",
            Self::Invoking => "invoking",
            Self::Compensating => "compensating",
            Self::Done => "done",
            Self::Reverted => "reverted",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether the transition table allows moving to `to`.
    pub fn can_transition_to(&self, to: StepState) -> bool {
        use StepState::*;
        match (self, to) {
            (Dormant, NotStarted) => true,
            (NotStarted, Invoking | Compensating | Failed | Skipped) => true,
            (Invoking, Failed | Done) => true,
            (Compensating, Reverted | Failed) => true,
            (Done, Compensating) => true,
            _ => false,
        }
    }

    /// Terminal states of a forward pass.
    pub fn is_invoke_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// States in which a step no longer blocks an ancestor's compensation.
    pub fn is_compensate_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Reverted | Self::Failed | Self::Dormant)
    }
}

/// Dispatch status of one phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not dispatched, or released for a retry.
    Idle,
    /// Completed successfully.
    Ok,
    /// Dispatched; a handler result or external completion is outstanding.
    Waiting,
    /// Failed with retry budget remaining.
    TemporaryFailure,
    /// Failed beyond the retry budget.
    PermanentFailure,
}

impl StepStatus {
    /// Convert to string for storage and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ok => "ok",
            Self::Waiting => "waiting",
            Self::TemporaryFailure => "temporary_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }

    /// Whether the transition table allows moving to `to`.
    ///
    /// Rescheduling is always allowed: any status may move back to WAITING.
    pub fn can_transition_to(&self, to: StepStatus) -> bool {
        use StepStatus::*;
        if to == Waiting {
            return true;
        }
        match (self, to) {
            (Waiting, Ok | TemporaryFailure | PermanentFailure) => true,
            (TemporaryFailure, Idle | PermanentFailure) => true,
            (PermanentFailure, Idle) => true,
            _ => false,
        }
    }
}

/// The (state, status) pair tracked per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub state: StepState,
    pub status: StepStatus,
}

impl PhaseProgress {
    /// Initial pair for the invoke phase.
    pub fn initial_invoke() -> Self {
        Self {
            state: StepState::NotStarted,
            status: StepStatus::Idle,
        }
    }

    /// Initial pair for the compensate phase.
    pub fn initial_compensate() -> Self {
        Self {
            state: StepState::Dormant,
            status: StepStatus::Idle,
        }
    }
}

/// Runtime state of one action within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Path id, `_root.<action>...`.
    pub id: String,
    /// User-facing action name; empty for the root.
    pub action: String,
    /// Distance from the root.
    pub depth: u32,
    /// Ordered child step ids.
    pub next: Vec<String>,
    /// Execution policy from the definition.
    pub policy: StepPolicy,
    /// Forward-phase progress.
    pub invoke: PhaseProgress,
    /// Rollback-phase progress.
    pub compensate: PhaseProgress,
    /// Dispatch count for the active phase.
    pub attempts: u32,
    /// Failure count for the active phase.
    pub failures: u32,
    /// When the active phase was last dispatched.
    pub last_attempt: Option<DateTime<Utc>>,
    /// When the step was first dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// Saved handler response, kept for child payload injection.
    pub response: Option<serde_json::Value>,
    /// True once compensation has begun for this step.
    pub step_failed: bool,
}

impl Step {
    /// Create a fresh step.
    pub fn new(
        id: impl Into<String>,
        action: impl Into<String>,
        depth: u32,
        next: Vec<String>,
        policy: StepPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            depth,
            next,
            policy,
            invoke: PhaseProgress::initial_invoke(),
            compensate: PhaseProgress::initial_compensate(),
            attempts: 0,
            failures: 0,
            last_attempt: None,
            started_at: None,
            response: None,
            step_failed: false,
        }
    }

    /// Whether this is the synthetic root.
    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    /// Parent step id, derived from the path; `None` for the root.
    pub fn parent_id(&self) -> Option<&str> {
        self.id.rfind(ID_SEPARATOR).map(|idx| &self.id[..idx])
    }

    /// The phase this step is currently executing.
    pub fn phase(&self) -> Phase {
        if self.step_failed {
            Phase::Compensate
        } else {
            Phase::Invoke
        }
    }

    /// Progress pair for the active phase.
    pub fn active_progress(&self) -> &PhaseProgress {
        self.progress_for(self.phase())
    }

    /// Progress pair for a specific phase.
    pub fn progress_for(&self, phase: Phase) -> &PhaseProgress {
        match phase {
            Phase::Invoke => &self.invoke,
            Phase::Compensate => &self.compensate,
        }
    }

    fn progress_for_mut(&mut self, phase: Phase) -> &mut PhaseProgress {
        match phase {
            Phase::Invoke => &mut self.invoke,
            Phase::Compensate => &mut self.compensate,
        }
    }

    /// Whether the given phase runs out-of-band.
    pub fn is_async(&self, phase: Phase) -> bool {
        match phase {
            Phase::Invoke => self.policy.async_invoke,
            Phase::Compensate => self.policy.async_compensate,
        }
    }

    /// Transition the state of `phase`, enforcing the transition table.
    pub fn set_state(&mut self, phase: Phase, to: StepState) -> Result<()> {
        let progress = self.progress_for(phase);
        if !progress.state.can_transition_to(to) {
            return Err(SagaError::InvalidTransition {
                step: self.id.clone(),
                from: progress.state.as_str(),
                to: to.as_str(),
            });
        }
        self.progress_for_mut(phase).state = to;
        Ok(())
    }

    /// Transition the status of `phase`, enforcing the transition table.
    pub fn set_status(&mut self, phase: Phase, to: StepStatus) -> Result<()> {
        let progress = self.progress_for(phase);
        if !progress.status.can_transition_to(to) {
            return Err(SagaError::InvalidTransition {
                step: self.id.clone(),
                from: progress.status.as_str(),
                to: to.as_str(),
            });
        }
        self.progress_for_mut(phase).status = to;
        Ok(())
    }

    /// Whether this step may be dispatched forward under `flow_state`.
    pub fn can_invoke(&self, flow_state: FlowState) -> bool {
        if flow_state != FlowState::Invoking || self.step_failed {
            return false;
        }
        matches!(
            (self.invoke.state, self.invoke.status),
            (StepState::NotStarted, StepStatus::Idle)
                | (StepState::Invoking, StepStatus::TemporaryFailure)
                | (StepState::Invoking, StepStatus::Idle)
        )
    }

    /// Whether this step may be dispatched for rollback under `flow_state`.
    pub fn can_compensate(&self, flow_state: FlowState) -> bool {
        if flow_state != FlowState::Compensating || !self.step_failed {
            return false;
        }
        matches!(
            (self.compensate.state, self.compensate.status),
            (StepState::NotStarted, StepStatus::Idle)
                | (StepState::Compensating, StepStatus::TemporaryFailure)
                | (StepState::Compensating, StepStatus::Idle)
        )
    }

    /// Flag the step for rollback: reset the attempt counters and wake the
    /// compensate phase. The invoke pair is left untouched so the forward
    /// outcome stays observable.
    pub fn begin_compensation(&mut self) -> Result<()> {
        self.set_state(Phase::Compensate, StepState::NotStarted)?;
        self.step_failed = true;
        self.attempts = 0;
        self.failures = 0;
        self.last_attempt = None;
        Ok(())
    }

    /// Mark the step skipped (an ancestor failed with continue-on-failure).
    pub fn skip(&mut self) -> Result<()> {
        self.set_state(Phase::Invoke, StepState::Skipped)
    }
}
