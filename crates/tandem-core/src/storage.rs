use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::Result;

/// What a timer fires for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerKind {
    /// Release a step parked in TEMPORARY_FAILURE.
    Retry { action: String },
    /// Fail a step that is still WAITING past its deadline.
    StepTimeout { action: String },
    /// Roll back a transaction that outlived its deadline.
    TransactionTimeout,
}

/// A scheduled wake-up owned by storage. Delivery is at-least-once; the
/// orchestrator re-checks state on every fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    /// Checkpoint key of the transaction, `<model_id>:<transaction_id>`.
    pub key: String,
    pub kind: TimerKind,
    pub fire_at: DateTime<Utc>,
    /// Originally requested interval in seconds, if any.
    pub interval: Option<u64>,
}

/// Options for archiving a finished checkpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveOptions {
    /// Seconds to keep the archived checkpoint around.
    pub retention_time: Option<u64>,
}

/// Durable key/value store for checkpoints plus timer scheduling and per-key
/// locking. Everything the orchestrator defers across process boundaries
/// goes through this trait.
#[async_trait]
pub trait SagaStorage: Send + Sync {
    /// Load a checkpoint.
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>>;

    /// List all live checkpoints.
    async fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Persist a checkpoint, optionally expiring it after `ttl` seconds.
    async fn save(&self, key: &str, checkpoint: &Checkpoint, ttl: Option<u64>) -> Result<()>;

    /// Remove a checkpoint. Called on terminal flow states.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Move a checkpoint out of the live set instead of deleting it.
    async fn archive(&self, key: &str, options: &ArchiveOptions) -> Result<()>;

    /// Schedule a retry release for a parked step. Replaces any pending
    /// retry timer for the same (key, action).
    async fn schedule_retry(
        &self,
        key: &str,
        action: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()>;

    /// Schedule a deadline for an outstanding step dispatch.
    async fn schedule_step_timeout(
        &self,
        key: &str,
        action: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()>;

    /// Schedule a deadline for the whole transaction.
    async fn schedule_transaction_timeout(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()>;

    /// Cancel a pending retry timer. Firing after clear is a no-op.
    async fn clear_retry(&self, key: &str, action: &str) -> Result<()>;

    /// Cancel a pending step timeout.
    async fn clear_step_timeout(&self, key: &str, action: &str) -> Result<()>;

    /// Cancel a pending transaction timeout.
    async fn clear_transaction_timeout(&self, key: &str) -> Result<()>;

    /// Pop timers whose fire time has passed, up to `limit`.
    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>>;

    /// Acquire the per-transaction mutex. Blocks until available.
    async fn acquire_lock(&self, key: &str) -> Result<()>;

    /// Release the per-transaction mutex.
    async fn release_lock(&self, key: &str) -> Result<()>;
}
