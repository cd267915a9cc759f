//! Eligibility rules and the scheduling pass.
//!
//! Forward execution walks the step table top-down, compensation walks it
//! bottom-up. One pass classifies every reachable step as waiting,
//! dispatchable, or settled; the driver alternates passes with dispatch
//! rounds until nothing is dispatchable.

use tandem_core::error::Result;
use tandem_core::events::FlowEvent;
use tandem_core::flow::{Flow, FlowState};
use tandem_core::step::{Step, StepState, StepStatus, ROOT_ID};
use tandem_core::storage::ArchiveOptions;

use super::{Orchestrator, Transaction};

/// Result of one scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingPass {
    /// Steps to dispatch now.
    pub next: Vec<String>,
    /// Step count excluding the root.
    pub total: usize,
    /// Steps not yet settled.
    pub remaining: usize,
    /// Settled steps.
    pub completed: usize,
}

/// How a settled step counts towards finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Done,
    Skipped,
    Reverted,
    /// Permanent failure under continue-on-failure; does not fail the flow.
    IgnoredFailure,
    /// Permanent failure that makes the flow FAILED.
    FatalFailure,
}

/// Classify a settled step by its active phase pair, or `None` while it is
/// still in flight.
fn classify(step: &Step) -> Option<Settled> {
    if step.step_failed {
        match step.compensate.state {
            StepState::Reverted => Some(Settled::Reverted),
            StepState::Failed => Some(Settled::FatalFailure),
            _ => None,
        }
    } else {
        match step.invoke.state {
            StepState::Done => Some(Settled::Done),
            StepState::Skipped => Some(Settled::Skipped),
            StepState::Failed => Some(if step.policy.continue_on_permanent_failure {
                Settled::IgnoredFailure
            } else {
                Settled::FatalFailure
            }),
            _ => None,
        }
    }
}

/// Whether children of `previous` may dispatch: the predecessor either
/// opted out of waiting or its whole sibling level has settled. The root is
/// always a valid predecessor.
pub(crate) fn can_move_forward(flow: &Flow, previous: &Step) -> bool {
    if previous.is_root() || previous.policy.no_wait {
        return true;
    }
    let Some(parent_id) = previous.parent_id() else {
        return true;
    };
    let Some(parent) = flow.step(parent_id) else {
        return false;
    };
    parent.next.iter().all(|sibling_id| {
        flow.step(sibling_id)
            .map(|s| s.invoke.state.is_invoke_settled())
            .unwrap_or(true)
    })
}

/// Whether `step` may compensate: all of its children have finished
/// compensating (or never needed to). Compensation is bottom-up.
pub(crate) fn can_move_backward(flow: &Flow, step: &Step) -> bool {
    step.next.iter().all(|child_id| {
        flow.step(child_id)
            .map(|c| c.compensate.state.is_compensate_settled())
            .unwrap_or(true)
    })
}

/// Whether the pass may consider `step` at all in the current direction.
pub(crate) fn can_continue(flow: &Flow, step: &Step) -> bool {
    if flow.state == FlowState::Compensating {
        return can_move_backward(flow, step);
    }
    match step.parent_id() {
        None => true,
        Some(ROOT_ID) => true,
        Some(parent_id) => flow
            .step(parent_id)
            .map(|parent| can_move_forward(flow, parent))
            .unwrap_or(false),
    }
}

impl Orchestrator {
    /// One scheduling pass: collect dispatchable steps, count settled ones,
    /// flip the flow into compensation when rollback is due, and finalize
    /// the flow when every step has settled.
    pub(crate) async fn check_all_steps(
        &self,
        transaction: &mut Transaction,
    ) -> Result<SchedulingPass> {
        loop {
            let total = transaction.flow.total_steps();
            if transaction.flow.state.is_terminal() {
                return Ok(SchedulingPass {
                    next: Vec::new(),
                    total,
                    remaining: 0,
                    completed: total,
                });
            }

            let flow_state = transaction.flow.state;
            let ordering = if flow_state == FlowState::Compensating {
                &self.compensate_order
            } else {
                &self.invoke_order
            };

            let mut next = Vec::new();
            let mut completed = 0usize;
            let mut has_waiting = false;
            let mut any_skipped = false;
            let mut any_reverted = false;
            let mut any_ignored_failure = false;
            let mut any_fatal_failure = false;

            for id in ordering {
                if id == ROOT_ID {
                    continue;
                }
                let Some(step) = transaction.flow.step(id) else {
                    continue;
                };
                if !can_continue(&transaction.flow, step) {
                    continue;
                }

                let progress = step.active_progress();
                let parked_on_timer = progress.status == StepStatus::TemporaryFailure
                    && step.policy.retry_interval.is_some();
                if progress.status == StepStatus::Waiting || parked_on_timer {
                    has_waiting = true;
                    continue;
                }
                if step.can_invoke(flow_state) || step.can_compensate(flow_state) {
                    next.push(id.clone());
                    continue;
                }

                completed += 1;
                match classify(step) {
                    Some(Settled::Skipped) => any_skipped = true,
                    Some(Settled::Reverted) => any_reverted = true,
                    Some(Settled::IgnoredFailure) => any_ignored_failure = true,
                    Some(Settled::FatalFailure) => any_fatal_failure = true,
                    Some(Settled::Done) | None => {}
                }
            }

            if transaction.flow.state == FlowState::WaitingToCompensate
                && next.is_empty()
                && !has_waiting
            {
                self.begin_rollback(transaction)?;
                continue;
            }

            if completed == total {
                let final_state = if any_fatal_failure {
                    FlowState::Failed
                } else if any_reverted {
                    FlowState::Reverted
                } else {
                    FlowState::Done
                };
                transaction.flow.state = final_state;
                transaction.flow.has_skipped_steps |= any_skipped;
                transaction.flow.has_failed_steps |= any_ignored_failure || any_fatal_failure;
                self.finish(transaction).await?;
                return Ok(SchedulingPass {
                    next: Vec::new(),
                    total,
                    remaining: 0,
                    completed,
                });
            }

            return Ok(SchedulingPass {
                next,
                total,
                remaining: total - completed,
                completed,
            });
        }
    }

    /// Flip the flow into COMPENSATING and flag every step that completed
    /// forward work (or failed permanently) for rollback.
    fn begin_rollback(&self, transaction: &mut Transaction) -> Result<()> {
        transaction.flow.state = FlowState::Compensating;
        tracing::info!(
            model_id = %self.model_id(),
            transaction_id = %transaction.flow.transaction_id,
            "Beginning compensation"
        );
        self.events().emit(&FlowEvent::CompensateBegin {
            transaction_id: transaction.flow.transaction_id.clone(),
        });

        for id in &self.compensate_order {
            let Some(step) = transaction.flow.step_mut(id) else {
                continue;
            };
            if step.is_root() || step.step_failed || step.policy.no_compensation {
                continue;
            }
            if step.invoke.state == StepState::Done
                || step.invoke.status == StepStatus::PermanentFailure
            {
                step.begin_compensation()?;
            }
        }
        Ok(())
    }

    /// Finalize a settled flow: clear the transaction timer, emit FINISH,
    /// and delete or archive the checkpoint.
    async fn finish(&self, transaction: &mut Transaction) -> Result<()> {
        let key = self.storage_key(&transaction.flow.transaction_id);
        if self.options().timeout.is_some() {
            self.storage().clear_transaction_timeout(&key).await?;
        }

        tracing::info!(
            model_id = %self.model_id(),
            transaction_id = %transaction.flow.transaction_id,
            state = %transaction.flow.state.as_str(),
            errors = transaction.errors.len(),
            "Transaction finished"
        );
        self.events().emit(&FlowEvent::Finish {
            transaction_id: transaction.flow.transaction_id.clone(),
            state: transaction.flow.state,
            errors: transaction.errors.clone(),
        });

        if self.options().store_execution {
            match self.options().retention_time {
                Some(retention_time) => {
                    self.storage()
                        .archive(
                            &key,
                            &ArchiveOptions {
                                retention_time: Some(retention_time),
                            },
                        )
                        .await?;
                }
                None => self.storage().delete(&key).await?,
            }
        }
        Ok(())
    }
}
