//! The execution driver: parallel dispatch of eligible steps and the
//! step outcome rules.

use chrono::{Duration as TimeDelta, Utc};
use futures::future::join_all;

use tandem_core::checkpoint::StepError;
use tandem_core::error::{Result, SagaError};
use tandem_core::events::FlowEvent;
use tandem_core::flow::FlowState;
use tandem_core::handler::StepOutcome;
use tandem_core::payload::{
    reply_topic, IdempotencyKey, PayloadMetadata, TransactionPayload, FORWARDED_RESPONSE_KEY,
};
use tandem_core::step::{Phase, StepState, StepStatus};

use super::{Orchestrator, Transaction};

struct Dispatch {
    id: String,
    action: String,
    phase: Phase,
    payload: TransactionPayload,
    timeout: Option<u64>,
}

impl Orchestrator {
    /// Dispatch every step in `next` in parallel, await their settlement
    /// collectively, and apply the outcome rules.
    pub(crate) async fn execute_next(
        &self,
        transaction: &mut Transaction,
        next: &[String],
    ) -> Result<()> {
        let now = Utc::now();
        let key = self.storage_key(&transaction.flow.transaction_id);
        let mut dispatches = Vec::with_capacity(next.len());

        for id in next {
            let (phase, attempt, data) = {
                let step = transaction
                    .flow
                    .step(id)
                    .ok_or_else(|| SagaError::UnknownAction(id.clone()))?;
                let phase = step.phase();
                let mut data = transaction.flow.input.clone();
                if let Some(parent) = step.parent_id().and_then(|pid| transaction.flow.step(pid)) {
                    if parent.policy.forward_response {
                        if let (Some(map), Some(response)) =
                            (data.as_object_mut(), parent.response.as_ref())
                        {
                            map.insert(FORWARDED_RESPONSE_KEY.to_string(), response.clone());
                        }
                    }
                }
                (phase, step.attempts + 1, data)
            };

            let (action, timeout) = {
                let step = transaction
                    .flow
                    .step_mut(id)
                    .ok_or_else(|| SagaError::UnknownAction(id.clone()))?;
                step.last_attempt = Some(now);
                step.attempts += 1;
                if step.started_at.is_none() {
                    step.started_at = Some(now);
                }
                if step.progress_for(phase).state == StepState::NotStarted {
                    let dispatched = match phase {
                        Phase::Invoke => StepState::Invoking,
                        Phase::Compensate => StepState::Compensating,
                    };
                    step.set_state(phase, dispatched)?;
                }
                step.set_status(phase, StepStatus::Waiting)?;
                (step.action.clone(), step.policy.timeout)
            };

            tracing::debug!(
                model_id = %self.model_id(),
                transaction_id = %transaction.flow.transaction_id,
                action = %action,
                phase = %phase,
                attempt,
                "Dispatching step"
            );
            self.events().emit(&FlowEvent::StepBegin {
                transaction_id: transaction.flow.transaction_id.clone(),
                action: action.clone(),
                phase,
            });

            let payload = TransactionPayload {
                metadata: PayloadMetadata {
                    producer: self.model_id().to_string(),
                    reply_to_topic: reply_topic(self.model_id()),
                    idempotency_key: IdempotencyKey::new(
                        &transaction.flow.transaction_id,
                        &action,
                        phase,
                    )
                    .to_string(),
                    action: action.clone(),
                    action_type: phase,
                    attempt,
                    timestamp: now,
                },
                data,
            };
            dispatches.push(Dispatch {
                id: id.clone(),
                action,
                phase,
                payload,
                timeout,
            });
        }

        for dispatch in &dispatches {
            if let Some(timeout) = dispatch.timeout {
                self.storage()
                    .schedule_step_timeout(
                        &key,
                        &dispatch.action,
                        now + TimeDelta::seconds(timeout as i64),
                        timeout,
                    )
                    .await?;
            }
        }

        let handler = transaction.handler.clone();
        let launches = dispatches.iter().map(|dispatch| {
            let handler = handler.clone();
            let action = dispatch.action.clone();
            let phase = dispatch.phase;
            let payload = dispatch.payload.clone();
            async move { handler(&action, phase, payload).await }
        });
        let results = join_all(launches).await;

        for (dispatch, result) in dispatches.into_iter().zip(results) {
            let is_async = transaction
                .flow
                .step(&dispatch.id)
                .map(|s| s.is_async(dispatch.phase))
                .unwrap_or(false);
            match result {
                Ok(outcome) if is_async => {
                    // Async steps settle only through external completion;
                    // the in-band return value is not a completion.
                    if !matches!(outcome, StepOutcome::Async) {
                        tracing::warn!(
                            action = %dispatch.action,
                            "Async step returned an in-band result; ignored"
                        );
                    }
                    self.events().emit(&FlowEvent::StepAwaiting {
                        transaction_id: transaction.flow.transaction_id.clone(),
                        action: dispatch.action.clone(),
                        phase: dispatch.phase,
                    });
                    self.save_checkpoint(transaction).await?;
                }
                Ok(StepOutcome::Completed(response)) => {
                    self.set_step_success(transaction, &dispatch.id, dispatch.phase, response)
                        .await?;
                }
                Ok(StepOutcome::Async) => {
                    let error = SagaError::PermanentStepFailure(format!(
                        "action '{}' returned the async sentinel but is not declared async",
                        dispatch.action
                    ));
                    self.set_step_failure(transaction, &dispatch.id, dispatch.phase, error)
                        .await?;
                }
                Err(error) => {
                    self.set_step_failure(transaction, &dispatch.id, dispatch.phase, error)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Apply the success rules to a step that settled `phase`.
    pub(crate) async fn set_step_success(
        &self,
        transaction: &mut Transaction,
        id: &str,
        phase: Phase,
        response: serde_json::Value,
    ) -> Result<()> {
        let key = self.storage_key(&transaction.flow.transaction_id);
        let (action, is_async, save_response, forward_response, had_timeout, had_retry) = {
            let step = transaction
                .flow
                .step_mut(id)
                .ok_or_else(|| SagaError::UnknownAction(id.to_string()))?;
            step.set_status(phase, StepStatus::Ok)?;
            let settled = match phase {
                Phase::Invoke => StepState::Done,
                Phase::Compensate => StepState::Reverted,
            };
            step.set_state(phase, settled)?;
            (
                step.action.clone(),
                step.is_async(phase),
                step.policy.save_response,
                step.policy.forward_response,
                step.policy.timeout.is_some(),
                step.policy.retry_interval.is_some(),
            )
        };

        if save_response {
            transaction
                .context
                .entry(action.clone())
                .or_default()
                .record(phase, response.clone());
            if forward_response && phase == Phase::Invoke {
                if let Some(step) = transaction.flow.step_mut(id) {
                    step.response = Some(response);
                }
            }
        }

        if had_timeout {
            self.storage().clear_step_timeout(&key, &action).await?;
        }
        if had_retry {
            self.storage().clear_retry(&key, &action).await?;
        }

        tracing::debug!(
            model_id = %self.model_id(),
            transaction_id = %transaction.flow.transaction_id,
            action = %action,
            phase = %phase,
            "Step succeeded"
        );
        let event = match phase {
            Phase::Invoke => FlowEvent::StepSuccess {
                transaction_id: transaction.flow.transaction_id.clone(),
                action,
            },
            Phase::Compensate => FlowEvent::CompensateStepSuccess {
                transaction_id: transaction.flow.transaction_id.clone(),
                action,
            },
        };
        self.events().emit(&event);

        if is_async {
            self.save_checkpoint(transaction).await?;
        }
        Ok(())
    }

    /// Apply the failure rules to a step that failed `phase`.
    ///
    /// Transient failures either park the step for a storage retry timer or
    /// leave it eligible for the next pass. Exhausting the retry budget
    /// fails the step permanently and, in the forward phase, either skips
    /// the subtree or triggers rollback.
    pub(crate) async fn set_step_failure(
        &self,
        transaction: &mut Transaction,
        id: &str,
        phase: Phase,
        error: SagaError,
    ) -> Result<()> {
        let key = self.storage_key(&transaction.flow.transaction_id);
        let transaction_id = transaction.flow.transaction_id.clone();
        let (action, is_async, permanent, continue_on_failure, retry_interval, had_timeout) = {
            let step = transaction
                .flow
                .step_mut(id)
                .ok_or_else(|| SagaError::UnknownAction(id.to_string()))?;
            if error.is_permanent() {
                step.failures = step.policy.max_retries + 1;
            } else {
                step.failures += 1;
            }
            step.set_status(phase, StepStatus::TemporaryFailure)?;
            (
                step.action.clone(),
                step.is_async(phase),
                step.failures > step.policy.max_retries,
                step.policy.continue_on_permanent_failure,
                step.policy.retry_interval,
                step.policy.timeout.is_some(),
            )
        };

        tracing::warn!(
            model_id = %self.model_id(),
            transaction_id = %transaction_id,
            action = %action,
            phase = %phase,
            permanent,
            error = %error,
            "Step failed"
        );
        let event = match phase {
            Phase::Invoke => FlowEvent::StepFailure {
                transaction_id: transaction_id.clone(),
                action: action.clone(),
                error: error.to_string(),
            },
            Phase::Compensate => FlowEvent::CompensateStepFailure {
                transaction_id: transaction_id.clone(),
                action: action.clone(),
                error: error.to_string(),
            },
        };
        self.events().emit(&event);

        if !permanent {
            if let Some(interval) = retry_interval {
                self.storage()
                    .schedule_retry(
                        &key,
                        &action,
                        Utc::now() + TimeDelta::seconds(interval as i64),
                        interval,
                    )
                    .await?;
            }
            // Without an interval the step stays TEMPORARY_FAILURE and the
            // next pass re-dispatches it immediately.
        } else {
            {
                let step = transaction.flow.step_mut(id).expect("step exists");
                step.set_status(phase, StepStatus::PermanentFailure)?;
                step.set_state(phase, StepState::Failed)?;
            }
            transaction.errors.push(StepError {
                action: action.clone(),
                phase,
                error: error.to_string(),
            });

            if had_timeout {
                self.storage().clear_step_timeout(&key, &action).await?;
            }
            if retry_interval.is_some() {
                self.storage().clear_retry(&key, &action).await?;
            }

            match phase {
                Phase::Invoke => {
                    if continue_on_failure {
                        self.skip_descendants(transaction, id)?;
                    } else if matches!(
                        transaction.flow.state,
                        FlowState::NotStarted | FlowState::Invoking
                    ) {
                        transaction.flow.state = FlowState::WaitingToCompensate;
                    }
                }
                Phase::Compensate => {
                    tracing::error!(
                        model_id = %self.model_id(),
                        transaction_id = %transaction_id,
                        action = %action,
                        "Compensation failed permanently"
                    );
                }
            }
        }

        if is_async {
            self.save_checkpoint(transaction).await?;
        }
        Ok(())
    }

    /// Skip the whole subtree under a permanently failed
    /// continue-on-failure step.
    fn skip_descendants(&self, transaction: &mut Transaction, id: &str) -> Result<()> {
        let mut descendants = transaction.flow.descendant_ids(id);
        descendants.sort();
        for descendant_id in descendants {
            let Some(step) = transaction.flow.step_mut(&descendant_id) else {
                continue;
            };
            if step.invoke.state != StepState::NotStarted {
                continue;
            }
            step.skip()?;
            let action = step.action.clone();
            self.events().emit(&FlowEvent::StepSkipped {
                transaction_id: transaction.flow.transaction_id.clone(),
                action,
            });
        }
        Ok(())
    }
}
