pub mod checkpoint;
pub mod definition;
pub mod error;
pub mod events;
pub mod flow;
pub mod handler;
pub mod payload;
pub mod step;
pub mod storage;

pub use checkpoint::{checkpoint_key, Checkpoint, StepError, StepOutputs};
pub use definition::{ModelOptions, StepDefinition, StepPolicy, DEFAULT_RETRIES};
pub use error::{Result, SagaError};
pub use events::{EventKind, FlowEvent};
pub use flow::{Flow, FlowState};
pub use handler::{step_handler, StepHandler, StepHandlerFn, StepOutcome};
pub use payload::{
    reply_topic, IdempotencyKey, PayloadMetadata, TransactionPayload, FORWARDED_RESPONSE_KEY,
    KEY_SEPARATOR, REPLY_TOPIC_PREFIX,
};
pub use step::{Phase, PhaseProgress, Step, StepState, StepStatus, ID_SEPARATOR, ROOT_ID};
pub use storage::{ArchiveOptions, SagaStorage, Timer, TimerKind};
