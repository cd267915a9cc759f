use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use tandem_core::error::Result;
use tandem_core::handler::StepHandler;

use crate::orchestrator::Orchestrator;

/// Configuration for the timer driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerDriverConfig {
    /// How often to poll storage for due timers.
    pub poll_interval: Duration,
    /// Maximum timers to pop per poll.
    pub batch_size: usize,
}

impl Default for TimerDriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Polls storage for due timers and delivers them to the orchestrator.
///
/// The orchestrator never holds its own timers; retries and timeouts are
/// durable storage entries so any process in the cluster can fire them.
pub struct TimerDriver {
    orchestrator: Arc<Orchestrator>,
    handler: StepHandler,
    config: TimerDriverConfig,
}

impl TimerDriver {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        handler: StepHandler,
        config: TimerDriverConfig,
    ) -> Self {
        Self {
            orchestrator,
            handler,
            config,
        }
    }

    /// Run the poll loop until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);

        tracing::info!(
            model_id = %self.orchestrator.model_id(),
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Timer driver started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.process_due().await {
                        tracing::error!(error = %e, "Failed to process due timers");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Timer driver shutting down");
                    break;
                }
            }
        }
    }

    /// Pop and deliver every due timer once. Exposed separately so tests
    /// and embedders can tick deterministically.
    pub async fn process_due(&self) -> Result<usize> {
        let due = self
            .orchestrator
            .storage()
            .due_timers(Utc::now(), self.config.batch_size)
            .await?;
        let count = due.len();
        for timer in due {
            if let Err(e) = self
                .orchestrator
                .deliver_timer(&timer, self.handler.clone())
                .await
            {
                tracing::error!(
                    key = %timer.key,
                    error = %e,
                    "Timer delivery failed"
                );
            }
        }
        Ok(count)
    }
}
