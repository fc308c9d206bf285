use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::lock::DistributedLock;

use super::{DistributedLockBackend, LockError};

struct Entry {
    lock_value: String,
    expires_at: chrono::DateTime<Utc>,
}

/// Single-process lock backend (spec.md §4.A "In-process").
///
/// Open Question (b): the teacher's closest analogue keyed its mutex
/// table fresh per call, which gives no real cross-caller exclusion.
/// This implementation keeps one `Mutex` per key for the lifetime of
/// the process, which is the behavior spec.md §4.A actually describes
/// ("mapping key → (value, expiresAt)").
pub struct InMemoryLock {
    entries: Arc<DashMap<String, Entry>>,
    key_mutexes: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            key_mutexes: Arc::new(DashMap::new()),
        }
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_mutexes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Removes entries past their expiry. Intended to be driven by a
    /// background task every 60s, per spec.md §4.A.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired in-memory locks");
        }
    }

    pub async fn run_sweep_loop(self: Arc<Self>, interval: Duration, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_expired(),
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[async_trait]
impl DistributedLockBackend for InMemoryLock {
    async fn acquire(&self, key: &str, expiry: Duration) -> Result<Option<DistributedLock>, LockError> {
        let mutex = self.mutex_for(key);
        let _guard = mutex.lock().await;

        let now = Utc::now();
        if let Some(existing) = self.entries.get(key) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }

        let lock_value = super::new_lock_value();
        let expires_at = now + chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::seconds(60));
        self.entries.insert(
            key.to_string(),
            Entry {
                lock_value: lock_value.clone(),
                expires_at,
            },
        );

        Ok(Some(DistributedLock {
            key: key.to_string(),
            lock_value,
            expires_at,
        }))
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(key)
            .map(|e| e.expires_at > now)
            .unwrap_or(false))
    }

    async fn extend(&self, lock: &DistributedLock, duration: Duration) -> Result<bool, LockError> {
        let mutex = self.mutex_for(&lock.key);
        let _guard = mutex.lock().await;

        match self.entries.get_mut(&lock.key) {
            Some(mut entry) if entry.lock_value == lock.lock_value => {
                entry.expires_at = Utc::now()
                    + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::seconds(60));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lock: &DistributedLock) -> Result<(), LockError> {
        let mutex = self.mutex_for(&lock.key);
        let _guard = mutex.lock().await;

        if let Some(entry) = self.entries.get(&lock.key) {
            if entry.lock_value == lock.lock_value {
                drop(entry);
                self.entries.remove(&lock.key);
            }
        }
        Ok(())
    }
}
