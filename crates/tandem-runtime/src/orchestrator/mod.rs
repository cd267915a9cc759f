use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{Duration as TimeDelta, Utc};

use tandem_core::checkpoint::{checkpoint_key, Checkpoint, StepError, StepOutputs};
use tandem_core::definition::{ModelOptions, StepDefinition};
use tandem_core::error::{Result, SagaError};
use tandem_core::events::FlowEvent;
use tandem_core::flow::{Flow, FlowState};
use tandem_core::handler::StepHandler;
use tandem_core::storage::SagaStorage;

use crate::emitter::EventEmitter;
use crate::topology;

mod completion;
mod executor;
mod scheduler;
mod timers;

pub use scheduler::SchedulingPass;

/// A transaction in flight: the flow, its captured errors, the per-action
/// handler outputs, and the handler driving it.
pub struct Transaction {
    pub flow: Flow,
    pub errors: Vec<StepError>,
    pub context: HashMap<String, StepOutputs>,
    pub(crate) handler: StepHandler,
}

impl Transaction {
    pub(crate) fn new(flow: Flow, handler: StepHandler) -> Self {
        Self {
            flow,
            errors: Vec::new(),
            context: HashMap::new(),
            handler,
        }
    }

    pub(crate) fn from_checkpoint(checkpoint: Checkpoint, handler: StepHandler) -> Self {
        Self {
            flow: checkpoint.flow,
            errors: checkpoint.errors,
            context: checkpoint.context,
            handler,
        }
    }

    /// Snapshot this transaction for storage.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            flow: self.flow.clone(),
            errors: self.errors.clone(),
            context: self.context.clone(),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.flow.transaction_id
    }

    pub fn state(&self) -> FlowState {
        self.flow.state
    }

    /// Whether the flow finished with skipped or permanently failed steps.
    pub fn is_partially_completed(&self) -> bool {
        self.flow.has_skipped_steps || self.flow.has_failed_steps
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("transaction_id", &self.flow.transaction_id)
            .field("state", &self.flow.state)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

/// Drives transactions of one model through their flows.
///
/// The orchestrator holds no per-transaction mutable state; a single
/// instance may drive many transactions concurrently.
pub struct Orchestrator {
    model_id: String,
    definition: StepDefinition,
    options: ModelOptions,
    storage: Arc<dyn SagaStorage>,
    emitter: EventEmitter,
    invoke_order: Vec<String>,
    compensate_order: Vec<String>,
    checkpoint_ttl: Option<u64>,
}

impl Orchestrator {
    /// Create an orchestrator for a model. Validates the definition and
    /// precomputes the dispatch orderings.
    pub fn new(
        model_id: impl Into<String>,
        definition: StepDefinition,
        options: ModelOptions,
        storage: Arc<dyn SagaStorage>,
    ) -> Result<Self> {
        let model_id = model_id.into();
        let built = topology::build(&definition)?;
        if !options.store_execution && definition.has_async_steps() {
            return Err(SagaError::IllegalState(format!(
                "model '{model_id}' declares async steps but disables checkpointing"
            )));
        }
        Ok(Self {
            model_id,
            definition,
            options,
            storage,
            emitter: EventEmitter::new(),
            invoke_order: built.invoke_order,
            compensate_order: built.compensate_order,
            checkpoint_ttl: None,
        })
    }

    /// Expire live checkpoints after `ttl` seconds.
    pub fn with_checkpoint_ttl(mut self, ttl: u64) -> Self {
        self.checkpoint_ttl = Some(ttl);
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// The lifecycle-event emitter for this model.
    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    pub(crate) fn storage(&self) -> &Arc<dyn SagaStorage> {
        &self.storage
    }

    pub(crate) fn storage_key(&self, transaction_id: &str) -> String {
        checkpoint_key(&self.model_id, transaction_id)
    }

    /// Create a transaction over this model's definition.
    ///
    /// Schedules the transaction timeout when the model has one and writes
    /// the initial checkpoint. With `options.idempotent`, a transaction id
    /// that already has a checkpoint rehydrates the existing transaction
    /// instead.
    pub async fn begin_transaction(
        &self,
        transaction_id: &str,
        handler: StepHandler,
        input: serde_json::Value,
    ) -> Result<Transaction> {
        let key = self.storage_key(transaction_id);

        if self.options.idempotent && self.options.store_execution {
            if let Some(checkpoint) = self.storage.get(&key).await? {
                tracing::debug!(
                    model_id = %self.model_id,
                    transaction_id = %transaction_id,
                    "Transaction already checkpointed, rehydrating"
                );
                return self.rehydrate_transaction(checkpoint, handler);
            }
        }

        let built = topology::build(&self.definition)?;
        let flow = Flow::new(
            &self.model_id,
            transaction_id,
            self.definition.clone(),
            input,
            built.steps,
        );
        let transaction = Transaction::new(flow, handler);

        tracing::info!(
            model_id = %self.model_id,
            transaction_id = %transaction_id,
            "Transaction started"
        );
        self.emitter.emit(&FlowEvent::Begin {
            transaction_id: transaction_id.to_string(),
        });

        if let Some(timeout) = self.options.timeout {
            self.storage
                .schedule_transaction_timeout(
                    &key,
                    Utc::now() + TimeDelta::seconds(timeout as i64),
                    timeout,
                )
                .await?;
        }
        self.save_checkpoint(&transaction).await?;

        Ok(transaction)
    }

    /// Drive a transaction until it finishes or suspends on outstanding
    /// work (async steps, timer-parked retries).
    pub async fn resume(&self, transaction: &mut Transaction) -> Result<()> {
        tracing::debug!(
            model_id = %self.model_id,
            transaction_id = %transaction.flow.transaction_id,
            state = %transaction.flow.state.as_str(),
            "Resuming transaction"
        );
        self.emitter.emit(&FlowEvent::Resume {
            transaction_id: transaction.flow.transaction_id.clone(),
        });
        if transaction.flow.state == FlowState::NotStarted {
            transaction.flow.state = FlowState::Invoking;
        }
        self.drive(transaction).await
    }

    /// Cooperatively cancel a transaction: completed steps are compensated,
    /// in-flight handler results are still applied. A no-op once rollback
    /// or a terminal state has been reached.
    pub async fn cancel_transaction(&self, transaction: &mut Transaction) -> Result<()> {
        if !matches!(
            transaction.flow.state,
            FlowState::NotStarted | FlowState::Invoking
        ) {
            return Ok(());
        }
        tracing::info!(
            model_id = %self.model_id,
            transaction_id = %transaction.flow.transaction_id,
            "Transaction cancelled"
        );
        transaction.flow.cancelled_at = Some(Utc::now());
        transaction.flow.state = FlowState::WaitingToCompensate;
        self.drive(transaction).await
    }

    /// Rebuild a transaction from its checkpoint, recomputing structural
    /// step fields from the stored definition.
    pub(crate) fn rehydrate_transaction(
        &self,
        checkpoint: Checkpoint,
        handler: StepHandler,
    ) -> Result<Transaction> {
        let mut transaction = Transaction::from_checkpoint(checkpoint, handler);
        topology::rehydrate(&mut transaction.flow)?;
        Ok(transaction)
    }

    /// Run scheduling passes and dispatch eligible steps until the flow
    /// finishes or nothing is dispatchable. Writes a checkpoint when the
    /// flow suspends non-terminally.
    pub(crate) async fn drive(&self, transaction: &mut Transaction) -> Result<()> {
        loop {
            let pass = self.check_all_steps(transaction).await?;
            if pass.next.is_empty() {
                break;
            }
            self.execute_next(transaction, &pass.next).await?;
        }
        if !transaction.flow.state.is_terminal() {
            self.save_checkpoint(transaction).await?;
        }
        Ok(())
    }

    pub(crate) async fn save_checkpoint(&self, transaction: &Transaction) -> Result<()> {
        if !self.options.store_execution {
            return Ok(());
        }
        let checkpoint = transaction.checkpoint();
        self.storage
            .save(&checkpoint.key(), &checkpoint, self.checkpoint_ttl)
            .await
    }
}
