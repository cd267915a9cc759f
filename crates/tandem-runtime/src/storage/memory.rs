//! In-memory storage backend, the default for embedded use and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use tokio::sync::Semaphore;

use tandem_core::checkpoint::Checkpoint;
use tandem_core::error::{Result, SagaError};
use tandem_core::storage::{ArchiveOptions, SagaStorage, Timer, TimerKind};

struct StoredCheckpoint {
    checkpoint: Checkpoint,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    checkpoints: Mutex<HashMap<String, StoredCheckpoint>>,
    archived: Mutex<HashMap<String, StoredCheckpoint>>,
    timers: Mutex<Vec<Timer>>,
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// In-memory [`SagaStorage`]: a checkpoint map with TTLs, a timer list, and
/// per-key semaphore locks. Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn expires(ttl: Option<u64>) -> Option<DateTime<Utc>> {
        ttl.map(|seconds| Utc::now() + TimeDelta::seconds(seconds as i64))
    }

    fn timer_matches(timer: &Timer, key: &str, kind: &TimerKind) -> bool {
        timer.key == key && timer.kind == *kind
    }

    fn put_timer(&self, timer: Timer) {
        let mut timers = self.inner.timers.lock().unwrap();
        timers.retain(|t| !Self::timer_matches(t, &timer.key, &timer.kind));
        timers.push(timer);
    }

    fn remove_timer(&self, key: &str, kind: &TimerKind) {
        let mut timers = self.inner.timers.lock().unwrap();
        timers.retain(|t| !Self::timer_matches(t, key, kind));
    }

    /// Timers currently scheduled, soonest first. Test observability.
    pub fn pending_timers(&self) -> Vec<Timer> {
        let mut timers = self.inner.timers.lock().unwrap().clone();
        timers.sort_by_key(|t| t.fire_at);
        timers
    }

    /// An archived checkpoint, if present. Test observability.
    pub fn archived(&self, key: &str) -> Option<Checkpoint> {
        self.inner
            .archived
            .lock()
            .unwrap()
            .get(key)
            .map(|stored| stored.checkpoint.clone())
    }
}

#[async_trait]
impl SagaStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Checkpoint>> {
        let mut checkpoints = self.inner.checkpoints.lock().unwrap();
        match checkpoints.get(key) {
            Some(stored) if stored.expires_at.is_some_and(|at| at <= Utc::now()) => {
                checkpoints.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.checkpoint.clone())),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let now = Utc::now();
        Ok(self
            .inner
            .checkpoints
            .lock()
            .unwrap()
            .values()
            .filter(|stored| !stored.expires_at.is_some_and(|at| at <= now))
            .map(|stored| stored.checkpoint.clone())
            .collect())
    }

    async fn save(&self, key: &str, checkpoint: &Checkpoint, ttl: Option<u64>) -> Result<()> {
        self.inner.checkpoints.lock().unwrap().insert(
            key.to_string(),
            StoredCheckpoint {
                checkpoint: checkpoint.clone(),
                expires_at: Self::expires(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.checkpoints.lock().unwrap().remove(key);
        Ok(())
    }

    async fn archive(&self, key: &str, options: &ArchiveOptions) -> Result<()> {
        let Some(stored) = self.inner.checkpoints.lock().unwrap().remove(key) else {
            return Ok(());
        };
        self.inner.archived.lock().unwrap().insert(
            key.to_string(),
            StoredCheckpoint {
                checkpoint: stored.checkpoint,
                expires_at: Self::expires(options.retention_time),
            },
        );
        Ok(())
    }

    async fn schedule_retry(
        &self,
        key: &str,
        action: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()> {
        self.put_timer(Timer {
            key: key.to_string(),
            kind: TimerKind::Retry {
                action: action.to_string(),
            },
            fire_at,
            interval: Some(interval),
        });
        Ok(())
    }

    async fn schedule_step_timeout(
        &self,
        key: &str,
        action: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()> {
        self.put_timer(Timer {
            key: key.to_string(),
            kind: TimerKind::StepTimeout {
                action: action.to_string(),
            },
            fire_at,
            interval: Some(interval),
        });
        Ok(())
    }

    async fn schedule_transaction_timeout(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        interval: u64,
    ) -> Result<()> {
        self.put_timer(Timer {
            key: key.to_string(),
            kind: TimerKind::TransactionTimeout,
            fire_at,
            interval: Some(interval),
        });
        Ok(())
    }

    async fn clear_retry(&self, key: &str, action: &str) -> Result<()> {
        self.remove_timer(
            key,
            &TimerKind::Retry {
                action: action.to_string(),
            },
        );
        Ok(())
    }

    async fn clear_step_timeout(&self, key: &str, action: &str) -> Result<()> {
        self.remove_timer(
            key,
            &TimerKind::StepTimeout {
                action: action.to_string(),
            },
        );
        Ok(())
    }

    async fn clear_transaction_timeout(&self, key: &str) -> Result<()> {
        self.remove_timer(key, &TimerKind::TransactionTimeout);
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>> {
        let mut timers = self.inner.timers.lock().unwrap();
        let mut due = Vec::new();
        let mut kept = Vec::new();
        for timer in timers.drain(..) {
            if timer.fire_at <= now && due.len() < limit {
                due.push(timer);
            } else {
                kept.push(timer);
            }
        }
        *timers = kept;
        due.sort_by_key(|t| t.fire_at);
        Ok(due)
    }

    async fn acquire_lock(&self, key: &str) -> Result<()> {
        let semaphore = {
            let mut locks = self.inner.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let permit = semaphore
            .acquire()
            .await
            .map_err(|e| SagaError::Storage(format!("lock closed: {e}")))?;
        permit.forget();
        Ok(())
    }

    async fn release_lock(&self, key: &str) -> Result<()> {
        let locks = self.inner.locks.lock().unwrap();
        let Some(semaphore) = locks.get(key) else {
            return Err(SagaError::Storage(format!(
                "release of unknown lock '{key}'"
            )));
        };
        semaphore.add_permits(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::definition::StepDefinition;
    use tandem_core::flow::Flow;

    fn checkpoint(key_suffix: &str) -> Checkpoint {
        let definition = StepDefinition::root(vec![StepDefinition::action("a")]);
        let steps = crate::topology::build(&definition).unwrap().steps;
        Checkpoint::new(Flow::new(
            "m",
            key_suffix,
            definition,
            serde_json::json!({}),
            steps,
        ))
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let storage = MemoryStorage::new();
        let cp = checkpoint("tx");
        storage.save("m:tx", &cp, None).await.unwrap();
        assert_eq!(storage.get("m:tx").await.unwrap(), Some(cp));
        assert_eq!(storage.list().await.unwrap().len(), 1);
        storage.delete("m:tx").await.unwrap();
        assert_eq!(storage.get("m:tx").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_checkpoint_is_gone() {
        let storage = MemoryStorage::new();
        storage.save("m:tx", &checkpoint("tx"), Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(storage.get("m:tx").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_archive_moves_out_of_live_set() {
        let storage = MemoryStorage::new();
        storage.save("m:tx", &checkpoint("tx"), None).await.unwrap();
        storage
            .archive("m:tx", &ArchiveOptions { retention_time: Some(60) })
            .await
            .unwrap();
        assert_eq!(storage.get("m:tx").await.unwrap(), None);
        assert!(storage.archived("m:tx").is_some());
    }

    #[tokio::test]
    async fn test_timers_pop_due_only_and_replace() {
        let storage = MemoryStorage::new();
        let past = Utc::now() - TimeDelta::seconds(1);
        let future = Utc::now() + TimeDelta::seconds(60);

        storage.schedule_retry("m:tx", "a", past, 5).await.unwrap();
        // Re-scheduling replaces the pending entry.
        storage.schedule_retry("m:tx", "a", past, 9).await.unwrap();
        storage
            .schedule_step_timeout("m:tx", "b", future, 30)
            .await
            .unwrap();
        assert_eq!(storage.pending_timers().len(), 2);

        let due = storage.due_timers(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].interval, Some(9));
        assert!(matches!(due[0].kind, TimerKind::Retry { ref action } if action == "a"));

        // Popped timers are gone; the future one remains.
        assert_eq!(storage.due_timers(Utc::now(), 10).await.unwrap().len(), 0);
        assert_eq!(storage.pending_timers().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_timers() {
        let storage = MemoryStorage::new();
        let past = Utc::now() - TimeDelta::seconds(1);
        storage.schedule_retry("m:tx", "a", past, 5).await.unwrap();
        storage
            .schedule_transaction_timeout("m:tx", past, 60)
            .await
            .unwrap();
        storage.clear_retry("m:tx", "a").await.unwrap();
        storage.clear_transaction_timeout("m:tx").await.unwrap();
        assert!(storage.due_timers(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let storage = MemoryStorage::new();
        storage.acquire_lock("m:tx").await.unwrap();

        let contender = storage.clone();
        let attempt = tokio::spawn(async move { contender.acquire_lock("m:tx").await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!attempt.is_finished());

        storage.release_lock("m:tx").await.unwrap();
        attempt.await.unwrap().unwrap();
        storage.release_lock("m:tx").await.unwrap();
    }

    #[tokio::test]
    async fn test_release_unknown_lock_errors() {
        let storage = MemoryStorage::new();
        assert!(storage.release_lock("nope").await.is_err());
    }
}
