//! Timer delivery: retries, step timeouts, and transaction timeouts fired
//! by storage come back through here.
//!
//! Timers are at-least-once. Every handler re-checks the live state after
//! loading the checkpoint, so a stale fire is a no-op.

use tandem_core::error::{Result, SagaError};
use tandem_core::events::FlowEvent;
use tandem_core::flow::FlowState;
use tandem_core::handler::StepHandler;
use tandem_core::step::StepStatus;
use tandem_core::storage::{Timer, TimerKind};

use super::{Orchestrator, Transaction};

impl Orchestrator {
    /// Deliver a due timer popped from storage.
    pub async fn deliver_timer(&self, timer: &Timer, handler: StepHandler) -> Result<()> {
        self.storage().acquire_lock(&timer.key).await?;
        let result = self.deliver_timer_locked(timer, handler).await;
        if let Err(unlock_error) = self.storage().release_lock(&timer.key).await {
            tracing::error!(
                key = %timer.key,
                error = %unlock_error,
                "Failed to release transaction lock"
            );
            if result.is_ok() {
                return Err(unlock_error);
            }
        }
        result
    }

    async fn deliver_timer_locked(&self, timer: &Timer, handler: StepHandler) -> Result<()> {
        let Some(checkpoint) = self.storage().get(&timer.key).await? else {
            tracing::debug!(key = %timer.key, "Timer fired for a finished transaction");
            return Ok(());
        };
        let mut transaction = self.rehydrate_transaction(checkpoint, handler)?;

        match &timer.kind {
            TimerKind::Retry { action } => {
                if !self.release_retry(&mut transaction, action)? {
                    return Ok(());
                }
            }
            TimerKind::StepTimeout { action } => {
                if !self.expire_step(&mut transaction, action).await? {
                    return Ok(());
                }
            }
            TimerKind::TransactionTimeout => {
                if !matches!(
                    transaction.flow.state,
                    FlowState::NotStarted | FlowState::Invoking
                ) {
                    tracing::debug!(
                        transaction_id = %transaction.flow.transaction_id,
                        "Transaction timeout fired in state {}; ignored",
                        transaction.flow.state.as_str()
                    );
                    return Ok(());
                }
                tracing::warn!(
                    model_id = %self.model_id(),
                    transaction_id = %transaction.flow.transaction_id,
                    "Transaction timed out, rolling back"
                );
                transaction.flow.state = FlowState::WaitingToCompensate;
                self.events().emit(&FlowEvent::Timeout {
                    transaction_id: transaction.flow.transaction_id.clone(),
                });
            }
        }

        self.drive(&mut transaction).await
    }

    /// Release a step parked on a retry timer. Returns false when the fire
    /// is stale.
    fn release_retry(&self, transaction: &mut Transaction, action: &str) -> Result<bool> {
        let step_id = transaction
            .flow
            .step_id_by_action(action)
            .ok_or_else(|| SagaError::UnknownAction(action.to_string()))?;
        let step = transaction.flow.step_mut(&step_id).expect("step exists");
        let phase = step.phase();
        if step.progress_for(phase).status != StepStatus::TemporaryFailure {
            tracing::debug!(action = %action, "Retry timer fired for a settled step; ignored");
            return Ok(false);
        }
        step.set_status(phase, StepStatus::Idle)?;
        tracing::debug!(
            model_id = %self.model_id(),
            transaction_id = %transaction.flow.transaction_id,
            action = %action,
            "Retry released"
        );
        Ok(true)
    }

    /// Fail a step that is still WAITING past its deadline. Returns false
    /// when the fire is stale.
    async fn expire_step(&self, transaction: &mut Transaction, action: &str) -> Result<bool> {
        let step_id = transaction
            .flow
            .step_id_by_action(action)
            .ok_or_else(|| SagaError::UnknownAction(action.to_string()))?;
        let step = transaction.flow.step(&step_id).expect("step exists");
        let phase = step.phase();
        if step.progress_for(phase).status != StepStatus::Waiting {
            tracing::debug!(action = %action, "Step timeout fired for a settled step; ignored");
            return Ok(false);
        }
        let error = SagaError::TimeoutElapsed(format!(
            "action '{action}' did not complete within its deadline"
        ));
        self.set_step_failure(transaction, &step_id, phase, error)
            .await?;
        Ok(true)
    }
}
