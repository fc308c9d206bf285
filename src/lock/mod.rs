//! Distributed Lock Service (spec.md §4.A).
//!
//! Three interchangeable backends share one fencing contract: each
//! acquisition mints a unique `lockValue`; `extend`/`release` must
//! present that same value or are rejected. Grounded on the teacher's
//! `RwLock`-guarded map idiom (`src/engine/storage.rs`'s
//! `InMemoryStorage`) for the in-process backend, generalized to a
//! `DashMap` since the lock table is accessed far more concurrently
//! than the teacher's workflow storage.

mod inmemory;
mod pg;
mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::models::lock::DistributedLock;

pub use inmemory::InMemoryLock;
pub use pg::PgAdvisoryLock;
pub use redis_backend::RedisLock;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock acquisition timed out for key {0}")]
    AcquireTimeout(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("backend error: {0}")]
    Backend(String),
}

/// A backend implementing the acquire/extend/release contract of
/// spec.md §4.A. All methods are non-blocking with respect to other
/// keys; only `acquire_with_retry` loops.
#[async_trait]
pub trait DistributedLockBackend: Send + Sync {
    async fn acquire(&self, key: &str, expiry: Duration) -> Result<Option<DistributedLock>, LockError>;

    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;

    /// Returns `true` iff `lock.lock_value` matched the current holder.
    async fn extend(&self, lock: &DistributedLock, duration: Duration) -> Result<bool, LockError>;

    /// A no-op when the caller is not the current holder (fencing).
    async fn release(&self, lock: &DistributedLock) -> Result<(), LockError>;
}

/// Convenience wrapper adding the retrying acquire and a handle type
/// that releases on drop via `tokio`'s blocking-free best-effort path
/// is deliberately NOT provided — spec.md §5 requires locks to have a
/// "guaranteed release path on all exits", which in async Rust means
/// callers use `LockHandle::release` inside a `finally`-equivalent
/// (`tokio::select!`/`?` with explicit release), not `Drop` (which
/// cannot run async code).
pub struct LockHandle<'a> {
    backend: &'a dyn DistributedLockBackend,
    lock: DistributedLock,
}

impl<'a> LockHandle<'a> {
    pub fn key(&self) -> &str {
        &self.lock.key
    }

    pub async fn extend(&self, duration: Duration) -> Result<bool, LockError> {
        self.backend.extend(&self.lock, duration).await
    }

    pub async fn release(self) -> Result<(), LockError> {
        self.backend.release(&self.lock).await
    }
}

/// Polls `acquire` until it succeeds, `timeout` elapses, or `cancel`
/// fires (spec.md §4.A `acquireWithRetry`).
pub async fn acquire_with_retry<'a>(
    backend: &'a dyn DistributedLockBackend,
    key: &str,
    expiry: Duration,
    timeout: Duration,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<LockHandle<'a>, LockError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        if let Some(lock) = backend.acquire(key, expiry).await? {
            return Ok(LockHandle { backend, lock });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LockError::AcquireTimeout(key.to_string()));
        }
        tokio::select! {
            _ = sleep(retry_delay) => {}
            _ = cancel.cancelled() => return Err(LockError::Cancelled),
        }
    }
}

pub fn new_lock_value() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_with_retry_times_out_when_never_free() {
        let backend = InMemoryLock::new();
        let cancel = CancellationToken::new();

        let held = backend
            .acquire("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let result = acquire_with_retry(
            &backend,
            "k",
            Duration::from_secs(60),
            Duration::from_millis(50),
            Duration::from_millis(10),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(LockError::AcquireTimeout(_))));
        backend.release(&held).await.unwrap();
    }
}
