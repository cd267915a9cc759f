//! Test doubles for driving orchestrations without real handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tandem_core::error::{Result, SagaError};
use tandem_core::handler::{step_handler, StepHandler, StepOutcome};
use tandem_core::payload::TransactionPayload;
use tandem_core::step::Phase;

/// One recorded handler invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub action: String,
    pub phase: Phase,
    pub payload: TransactionPayload,
}

/// What a scripted action does when invoked.
#[derive(Debug, Clone)]
pub enum StepBehavior {
    /// Respond with this value.
    Succeed(serde_json::Value),
    /// Fail transiently every time.
    Fail(String),
    /// Fail permanently, bypassing retries.
    FailPermanent(String),
    /// Fail transiently the first `n` invocations, then succeed.
    FailTimes(u32, serde_json::Value),
    /// Return the async sentinel.
    GoAsync,
}

#[derive(Default)]
struct Inner {
    invocations: Mutex<Vec<Invocation>>,
    scripts: Mutex<HashMap<(String, Phase), StepBehavior>>,
}

/// A scripted, recording step handler.
///
/// Unscripted invocations succeed with `{"done": <action>}`. Every
/// invocation is recorded for assertion.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    inner: Arc<Inner>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the invoke phase of an action.
    pub fn on_invoke(&self, action: impl Into<String>, behavior: StepBehavior) -> &Self {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert((action.into(), Phase::Invoke), behavior);
        self
    }

    /// Script the compensate phase of an action.
    pub fn on_compensate(&self, action: impl Into<String>, behavior: StepBehavior) -> &Self {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert((action.into(), Phase::Compensate), behavior);
        self
    }

    /// Build the [`StepHandler`] backed by this script.
    pub fn handler(&self) -> StepHandler {
        let inner = self.inner.clone();
        step_handler(move |action, phase, payload| {
            let inner = inner.clone();
            async move {
                let preceding = {
                    let mut invocations = inner.invocations.lock().unwrap();
                    let preceding = invocations
                        .iter()
                        .filter(|i| i.action == action && i.phase == phase)
                        .count() as u32;
                    invocations.push(Invocation {
                        action: action.clone(),
                        phase,
                        payload,
                    });
                    preceding
                };
                let behavior = inner
                    .scripts
                    .lock()
                    .unwrap()
                    .get(&(action.clone(), phase))
                    .cloned();
                run_behavior(&action, behavior, preceding)
            }
        })
    }

    /// All invocations, in dispatch order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.inner.invocations.lock().unwrap().clone()
    }

    /// Invoked action names in order, restricted to one phase.
    pub fn invoked_actions(&self, phase: Phase) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|i| i.phase == phase)
            .map(|i| i.action)
            .collect()
    }

    /// How many times an (action, phase) pair was invoked.
    pub fn count(&self, action: &str, phase: Phase) -> usize {
        self.invocations()
            .iter()
            .filter(|i| i.action == action && i.phase == phase)
            .count()
    }
}

fn run_behavior(
    action: &str,
    behavior: Option<StepBehavior>,
    preceding: u32,
) -> Result<StepOutcome> {
    match behavior {
        None => Ok(StepOutcome::Completed(serde_json::json!({"done": action}))),
        Some(StepBehavior::Succeed(value)) => Ok(StepOutcome::Completed(value)),
        Some(StepBehavior::Fail(message)) => Err(SagaError::TransientStepFailure(message)),
        Some(StepBehavior::FailPermanent(message)) => {
            Err(SagaError::PermanentStepFailure(message))
        }
        Some(StepBehavior::FailTimes(times, value)) => {
            if preceding < times {
                Err(SagaError::TransientStepFailure(format!(
                    "{action} failed (attempt {})",
                    preceding + 1
                )))
            } else {
                Ok(StepOutcome::Completed(value))
            }
        }
        Some(StepBehavior::GoAsync) => Ok(StepOutcome::Async),
    }
}
