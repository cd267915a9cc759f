use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::payload::TransactionPayload;
use crate::step::Phase;

/// What a handler invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished in-band with this response.
    Completed(serde_json::Value),
    /// The async sentinel: the step completes out-of-band via
    /// `register_step_success` / `register_step_failure`.
    Async,
}

/// Type alias for the boxed step handler function.
///
/// The handler is called once per dispatch with the action name, the phase
/// being executed, and the assembled payload. Returning `Err` triggers the
/// failure rules; `SagaError::PermanentStepFailure` bypasses the retry
/// budget.
pub type StepHandlerFn = dyn Fn(&str, Phase, TransactionPayload) -> Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send>>
    + Send
    + Sync;

/// Shared handle to a step handler.
pub type StepHandler = Arc<StepHandlerFn>;

/// Wrap an async closure into a [`StepHandler`].
pub fn step_handler<F, Fut>(f: F) -> StepHandler
where
    F: Fn(String, Phase, TransactionPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
{
    Arc::new(move |action, phase, payload| Box::pin(f(action.to_string(), phase, payload)))
}
