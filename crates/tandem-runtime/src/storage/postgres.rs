//! Postgres storage backend.
//!
//! Checkpoints live in `tandem_checkpoints` as JSONB, timers in
//! `tandem_timers` popped with `FOR UPDATE SKIP LOCKED`, and the per-key
//! mutex is a row in `tandem_locks`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use tandem_core::checkpoint::Checkpoint;
use tandem_core::error::{Result, SagaError};
use tandem_core::storage::{ArchiveOptions, SagaStorage, Timer, TimerKind};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tandem_checkpoints (
    key        TEXT PRIMARY KEY,
    checkpoint JSONB NOT NULL,
    archived   BOOLEAN NOT NULL DEFAULT FALSE,
    expires_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS tandem_timers (
    key              TEXT NOT NULL,
    kind             TEXT NOT NULL,
    action           TEXT NOT NULL DEFAULT '',
    fire_at          TIMESTAMPTZ NOT NULL,
    interval_seconds BIGINT,
    PRIMARY KEY (key, kind, action)
);

CREATE INDEX IF NOT EXISTS tandem_timers_fire_at_idx ON tandem_timers (fire_at);

CREATE TABLE IF NOT EXISTS tandem_locks (
    key       TEXT PRIMARY KEY,
    locked_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const KIND_RETRY: &str = "retry";
const KIND_STEP_TIMEOUT: &str = "step_timeout";
const KIND_TRANSACTION_TIMEOUT: &str = "transaction_timeout";

fn kind_columns(kind: &TimerKind) -> (&'static str, &str) {
    match kind {
        TimerKind::Retry { action } => (KIND_RETRY, action),
        TimerKind::StepTimeout { action } => (KIND_STEP_TIMEOUT, action),
        TimerKind::TransactionTimeout => (KIND_TRANSACTION_TIMEOUT, ""),
    }
}

fn kind_from_columns(kind: &str, action: String) -> Result<TimerKind> {
    match kind {
        KIND_RETRY => Ok(TimerKind::Retry { action }),
        KIND_STEP_TIMEOUT => Ok(TimerKind::StepTimeout { action }),
        KIND_TRANSACTION_TIMEOUT => Ok(TimerKind::TransactionTimeout),
        other => Err(SagaError::Storage(format!("unknown timer kind '{other}'"))),
    }
}

fn db_err(e: sqlx::Error) -> SagaError {
    SagaError::Storage(e.to_string())
}

/// Postgres-backed [`SagaStorage`].
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
    lock_retry_interval: Duration,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_retry_interval: Duration::from_millis(50),
        }
    }

    /// Create the backing tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn schedule(
        &self,
        key: &str,
        kind: TimerKind,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()> {
        let (kind, action) = kind_columns(&kind);
        sqlx::query(
            r#"
            INSERT INTO tandem_timers (key, kind, action, fire_at, interval_seconds)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key, kind, action) DO UPDATE SET
                fire_at = EXCLUDED.fire_at,
                interval_seconds = EXCLUDED.interval_seconds
            "#,
        )
        .bind(key)
        .bind(kind)
        .bind(action)
        .bind(fire_at)
        .bind(interval as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self, key: &str, kind: TimerKind) -> Result<()> {
        let (kind, action) = kind_columns(&kind);
        sqlx::query("DELETE FROM tandem_timers WHERE key = $1 AND kind = $2 AND action = $3")
            .bind(key)
            .bind(kind)
            .bind(action)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SagaStorage for PgStorage {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT checkpoint FROM tandem_checkpoints
            WHERE key = $1
              AND NOT archived
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            let value: serde_json::Value = row.get("checkpoint");
            serde_json::from_value(value).map_err(SagaError::from)
        })
        .transpose()
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT checkpoint FROM tandem_checkpoints
            WHERE NOT archived
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let value: serde_json::Value = row.get("checkpoint");
                serde_json::from_value(value).map_err(SagaError::from)
            })
            .collect()
    }

    async fn save(&self, key: &str, checkpoint: &Checkpoint, ttl: Option<u64>) -> Result<()> {
        let value = serde_json::to_value(checkpoint)?;
        sqlx::query(
            r#"
            INSERT INTO tandem_checkpoints (key, checkpoint, archived, expires_at, updated_at)
            VALUES ($1, $2, FALSE, NOW() + make_interval(secs => $3), NOW())
            ON CONFLICT (key) DO UPDATE SET
                checkpoint = EXCLUDED.checkpoint,
                archived = FALSE,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(|t| t as f64))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM tandem_checkpoints WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn archive(&self, key: &str, options: &ArchiveOptions) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tandem_checkpoints
            SET archived = TRUE,
                expires_at = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(options.retention_time.map(|t| t as f64))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        key: &str,
        action: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()> {
        self.schedule(
            key,
            TimerKind::Retry {
                action: action.to_string(),
            },
            fire_at,
            interval,
        )
        .await
    }

    async fn schedule_step_timeout(
        &self,
        key: &str,
        action: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()> {
        self.schedule(
            key,
            TimerKind::StepTimeout {
                action: action.to_string(),
            },
            fire_at,
            interval,
        )
        .await
    }

    async fn schedule_transaction_timeout(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()> {
        self.schedule(key, TimerKind::TransactionTimeout, fire_at, interval)
            .await
    }

    async fn clear_retry(&self, key: &str, action: &str) -> Result<()> {
        self.clear(
            key,
            TimerKind::Retry {
                action: action.to_string(),
            },
        )
        .await
    }

    async fn clear_step_timeout(&self, key: &str, action: &str) -> Result<()> {
        self.clear(
            key,
            TimerKind::StepTimeout {
                action: action.to_string(),
            },
        )
        .await
    }

    async fn clear_transaction_timeout(&self, key: &str) -> Result<()> {
        self.clear(key, TimerKind::TransactionTimeout).await
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM tandem_timers
            WHERE (key, kind, action) IN (
                SELECT key, kind, action FROM tandem_timers
                WHERE fire_at <= $1
                ORDER BY fire_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING key, kind, action, fire_at, interval_seconds
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let action: String = row.get("action");
                Ok(Timer {
                    key: row.get("key"),
                    kind: kind_from_columns(&kind, action)?,
                    fire_at: row.get("fire_at"),
                    interval: row
                        .get::<Option<i64>, _>("interval_seconds")
                        .map(|i| i as u64),
                })
            })
            .collect()
    }

    async fn acquire_lock(&self, key: &str) -> Result<()> {
        loop {
            let result = sqlx::query(
                "INSERT INTO tandem_locks (key) VALUES ($1) ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            if result.rows_affected() == 1 {
                return Ok(());
            }
            tokio::time::sleep(self.lock_retry_interval).await;
        }
    }

    async fn release_lock(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM tandem_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
