use crate::checkpoint::StepError;
use crate::flow::FlowState;
use crate::step::Phase;

/// Lifecycle events emitted while driving a transaction.
///
/// Delivery ordering within one transaction follows the state changes that
/// produced the events; across transactions no ordering is guaranteed.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Begin {
        transaction_id: String,
    },
    Resume {
        transaction_id: String,
    },
    StepBegin {
        transaction_id: String,
        action: String,
        phase: Phase,
    },
    StepSuccess {
        transaction_id: String,
        action: String,
    },
    StepFailure {
        transaction_id: String,
        action: String,
        error: String,
    },
    /// An async step's handler returned without completing.
    StepAwaiting {
        transaction_id: String,
        action: String,
        phase: Phase,
    },
    StepSkipped {
        transaction_id: String,
        action: String,
    },
    CompensateBegin {
        transaction_id: String,
    },
    CompensateStepSuccess {
        transaction_id: String,
        action: String,
    },
    CompensateStepFailure {
        transaction_id: String,
        action: String,
        error: String,
    },
    Timeout {
        transaction_id: String,
    },
    Finish {
        transaction_id: String,
        state: FlowState,
        errors: Vec<StepError>,
    },
}

/// Discriminant used for event subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Begin,
    Resume,
    StepBegin,
    StepSuccess,
    StepFailure,
    StepAwaiting,
    StepSkipped,
    CompensateBegin,
    CompensateStepSuccess,
    CompensateStepFailure,
    Timeout,
    Finish,
}

impl FlowEvent {
    /// The subscription discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Begin { .. } => EventKind::Begin,
            Self::Resume { .. } => EventKind::Resume,
            Self::StepBegin { .. } => EventKind::StepBegin,
            Self::StepSuccess { .. } => EventKind::StepSuccess,
            Self::StepFailure { .. } => EventKind::StepFailure,
            Self::StepAwaiting { .. } => EventKind::StepAwaiting,
            Self::StepSkipped { .. } => EventKind::StepSkipped,
            Self::CompensateBegin { .. } => EventKind::CompensateBegin,
            Self::CompensateStepSuccess { .. } => EventKind::CompensateStepSuccess,
            Self::CompensateStepFailure { .. } => EventKind::CompensateStepFailure,
            Self::Timeout { .. } => EventKind::Timeout,
            Self::Finish { .. } => EventKind::Finish,
        }
    }

    /// The transaction this event belongs to.
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Begin { transaction_id }
            | Self::Resume { transaction_id }
            | Self::StepBegin { transaction_id, .. }
            | Self::StepSuccess { transaction_id, .. }
            | Self::StepFailure { transaction_id, .. }
            | Self::StepAwaiting { transaction_id, .. }
            | Self::StepSkipped { transaction_id, .. }
            | Self::CompensateBegin { transaction_id }
            | Self::CompensateStepSuccess { transaction_id, .. }
            | Self::CompensateStepFailure { transaction_id, .. }
            | Self::Timeout { transaction_id }
            | Self::Finish { transaction_id, .. } => transaction_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let event = FlowEvent::StepBegin {
            transaction_id: "tx".into(),
            action: "a".into(),
            phase: Phase::Invoke,
        };
        assert_eq!(event.kind(), EventKind::StepBegin);
        assert_eq!(event.transaction_id(), "tx");

        let finish = FlowEvent::Finish {
            transaction_id: "tx".into(),
            state: FlowState::Done,
            errors: vec![],
        };
        assert_eq!(finish.kind(), EventKind::Finish);
    }
}
