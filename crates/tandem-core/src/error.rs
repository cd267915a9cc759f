use thiserror::Error;

/// Core error type for saga operations.
#[derive(Error, Debug)]
pub enum SagaError {
    #[error("Invalid transition for step '{step}': {from} -> {to}")]
    InvalidTransition {
        step: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Duplicate action: {0}")]
    DuplicateAction(String),

    #[error("Invalid action name: {0}")]
    InvalidAction(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Permanent step failure: {0}")]
    PermanentStepFailure(String),

    #[error("Transient step failure: {0}")]
    TransientStepFailure(String),

    #[error("Compensation failure: {0}")]
    CompensationFailure(String),

    #[error("Timeout elapsed: {0}")]
    TimeoutElapsed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SagaError {
    /// Whether a handler error bypasses the retry budget.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::PermanentStepFailure(_) | Self::TimeoutElapsed(_)
        )
    }
}

impl From<serde_json::Error> for SagaError {
    fn from(e: serde_json::Error) -> Self {
        SagaError::Serialization(e.to_string())
    }
}

/// Result type alias using SagaError.
pub type Result<T> = std::result::Result<T, SagaError>;
