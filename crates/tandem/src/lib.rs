//! Tandem: a distributed-transaction (saga) orchestration engine.
//!
//! A transaction model is a DAG of named actions. The orchestrator drives
//! each transaction forward through a caller-supplied handler, retries
//! failed steps, compensates completed ones when a step fails permanently,
//! and checkpoints everything through pluggable storage so execution can
//! resume in another process.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem::prelude::*;
//!
//! # async fn demo() -> tandem::Result<()> {
//! let definition = StepDefinition::root(vec![
//!     StepDefinition::action("reserve").forward_response(),
//!     StepDefinition::action("charge").max_retries(2),
//! ]);
//! let storage = Arc::new(MemoryStorage::new());
//! let orchestrator = Orchestrator::new("orders", definition, ModelOptions::default(), storage)?;
//!
//! let handler = step_handler(|action, phase, _payload| async move {
//!     match phase {
//!         Phase::Invoke => Ok(StepOutcome::Completed(serde_json::json!({"ok": action}))),
//!         Phase::Compensate => Ok(StepOutcome::Completed(serde_json::json!(null))),
//!     }
//! });
//!
//! let mut transaction = orchestrator
//!     .begin_transaction("order-1", handler, serde_json::json!({"sku": "x"}))
//!     .await?;
//! orchestrator.resume(&mut transaction).await?;
//! # Ok(())
//! # }
//! ```

pub use tandem_core::{
    checkpoint_key, reply_topic, step_handler, ArchiveOptions, Checkpoint, EventKind, Flow,
    FlowEvent, FlowState, IdempotencyKey, ModelOptions, PayloadMetadata, Phase, PhaseProgress,
    Result, SagaError, SagaStorage, Step, StepDefinition, StepError, StepHandler, StepHandlerFn,
    StepOutcome, StepOutputs, StepPolicy, StepState, StepStatus, Timer, TimerKind,
    TransactionPayload, DEFAULT_RETRIES, FORWARDED_RESPONSE_KEY, ID_SEPARATOR, KEY_SEPARATOR,
    REPLY_TOPIC_PREFIX, ROOT_ID,
};
pub use tandem_runtime::{
    EngineConfig, EventEmitter, MemoryStorage, ModelRegistry, Orchestrator, PgStorage,
    RegisteredModel, SubscriptionId, TimerDriver, TimerDriverConfig, Transaction,
};

#[cfg(feature = "testing")]
pub use tandem_runtime::testing;

/// The commonly needed surface in one import.
pub mod prelude {
    pub use tandem_core::{
        step_handler, FlowEvent, FlowState, ModelOptions, Phase, Result, SagaError, SagaStorage,
        StepDefinition, StepOutcome, StepState, StepStatus,
    };
    pub use tandem_runtime::{
        MemoryStorage, ModelRegistry, Orchestrator, TimerDriver, TimerDriverConfig, Transaction,
    };
}
