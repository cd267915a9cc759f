//! External completion: async steps settle out-of-band through the
//! idempotency key published in their payload metadata.
//!
//! Every path serializes on the storage lock for the transaction, so
//! concurrent completions and timer fires advance the flow at most once.

use tandem_core::error::{Result, SagaError};
use tandem_core::handler::StepHandler;
use tandem_core::payload::IdempotencyKey;
use tandem_core::step::StepStatus;

use super::{Orchestrator, Transaction};

enum Completion {
    Success(serde_json::Value),
    Failure(SagaError),
}

impl Orchestrator {
    /// Complete an async step successfully, identified by its idempotency
    /// key, and drive the flow onward.
    ///
    /// A duplicate call after the step already succeeded is a no-op
    /// returning the current transaction. An unknown action fails with
    /// `UnknownAction`; a step that is not WAITING, or a phase mismatch,
    /// fails with `IllegalState`.
    pub async fn register_step_success(
        &self,
        idempotency_key: &str,
        handler: StepHandler,
        response: serde_json::Value,
    ) -> Result<Transaction> {
        self.register_completion(idempotency_key, handler, Completion::Success(response))
            .await
    }

    /// Complete an async step with a failure; `SagaError::PermanentStepFailure`
    /// bypasses the retry budget. Symmetric to [`register_step_success`].
    ///
    /// [`register_step_success`]: Orchestrator::register_step_success
    pub async fn register_step_failure(
        &self,
        idempotency_key: &str,
        error: SagaError,
        handler: StepHandler,
    ) -> Result<Transaction> {
        self.register_completion(idempotency_key, handler, Completion::Failure(error))
            .await
    }

    async fn register_completion(
        &self,
        idempotency_key: &str,
        handler: StepHandler,
        completion: Completion,
    ) -> Result<Transaction> {
        if !self.options().store_execution {
            return Err(SagaError::IllegalState(
                "external completion requires checkpointing (store_execution)".into(),
            ));
        }
        let key: IdempotencyKey = idempotency_key.parse()?;
        let storage_key = self.storage_key(&key.transaction_id);

        self.storage().acquire_lock(&storage_key).await?;
        let result = self
            .apply_completion(&key, &storage_key, handler, completion)
            .await;
        if let Err(unlock_error) = self.storage().release_lock(&storage_key).await {
            tracing::error!(
                transaction_id = %key.transaction_id,
                error = %unlock_error,
                "Failed to release transaction lock"
            );
            if result.is_ok() {
                return Err(unlock_error);
            }
        }
        result
    }

    async fn apply_completion(
        &self,
        key: &IdempotencyKey,
        storage_key: &str,
        handler: StepHandler,
        completion: Completion,
    ) -> Result<Transaction> {
        let checkpoint = self.storage().get(storage_key).await?.ok_or_else(|| {
            SagaError::IllegalState(format!(
                "transaction '{}' has no checkpoint",
                key.transaction_id
            ))
        })?;
        let mut transaction = self.rehydrate_transaction(checkpoint, handler)?;

        let step_id = transaction
            .flow
            .step_id_by_action(&key.action)
            .ok_or_else(|| SagaError::UnknownAction(key.action.clone()))?;
        let step = transaction.flow.step(&step_id).expect("step exists");
        let progress = step.progress_for(key.phase);

        // Duplicate completions with the same polarity are no-ops.
        match (&completion, progress.status) {
            (Completion::Success(_), StepStatus::Ok)
            | (Completion::Failure(_), StepStatus::PermanentFailure) => {
                tracing::debug!(
                    transaction_id = %key.transaction_id,
                    action = %key.action,
                    "Duplicate completion ignored"
                );
                return Ok(transaction);
            }
            _ => {}
        }

        if step.phase() != key.phase || progress.status != StepStatus::Waiting {
            return Err(SagaError::IllegalState(format!(
                "step '{}' is not awaiting {} completion (state {}, status {})",
                key.action,
                key.phase,
                progress.state.as_str(),
                progress.status.as_str()
            )));
        }

        tracing::debug!(
            model_id = %self.model_id(),
            transaction_id = %key.transaction_id,
            action = %key.action,
            phase = %key.phase,
            "External completion received"
        );
        match completion {
            Completion::Success(response) => {
                self.set_step_success(&mut transaction, &step_id, key.phase, response)
                    .await?;
            }
            Completion::Failure(error) => {
                self.set_step_failure(&mut transaction, &step_id, key.phase, error)
                    .await?;
            }
        }

        self.drive(&mut transaction).await?;
        Ok(transaction)
    }
}
