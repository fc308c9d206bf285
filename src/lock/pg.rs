use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};

use crate::models::lock::DistributedLock;

use super::{DistributedLockBackend, LockError};

struct HeldLock {
    lock_value: String,
    conn: PoolConnection<Postgres>,
}

/// Relational advisory lock backend (spec.md §4.A "Relational
/// advisory"). Session-scoped advisory locks are only meaningful when
/// acquire and release run on the same connection, so a successful
/// `acquire` pins a dedicated `PoolConnection` in `held` (keyed by lock
/// key) rather than borrowing from `self.pool` per call; `extend`/
/// `release` fence on `lock_value` matching the pinned entry before
/// touching it, the same compare-then-mutate contract
/// `lock/redis_backend.rs`'s Lua scripts and `lock/inmemory.rs`'s
/// keyed-mutex table already enforce.
pub struct PgAdvisoryLock {
    pool: PgPool,
    held: DashMap<String, HeldLock>,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: DashMap::new(),
        }
    }

    fn hash_key(key: &str) -> i64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as i64
    }
}

#[async_trait]
impl DistributedLockBackend for PgAdvisoryLock {
    async fn acquire(&self, key: &str, expiry: Duration) -> Result<Option<DistributedLock>, LockError> {
        let hashed = Self::hash_key(key);

        let mut conn = self.pool.acquire().await.map_err(|e| LockError::Backend(e.to_string()))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(hashed)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if !acquired {
            return Ok(None);
        }

        let lock_value = super::new_lock_value();
        self.held.insert(
            key.to_string(),
            HeldLock {
                lock_value: lock_value.clone(),
                conn,
            },
        );

        Ok(Some(DistributedLock {
            key: key.to_string(),
            lock_value,
            expires_at: Utc::now() + chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::seconds(60)),
        }))
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let hashed = Self::hash_key(key);
        let locked: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pg_locks WHERE locktype = 'advisory' AND objid = $1)",
        )
        .bind(hashed as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(locked)
    }

    /// Postgres advisory locks do not expire server-side; extension is
    /// a pure bookkeeping no-op, but only once fencing confirms the
    /// caller still holds `lock.lock_value` on the pinned connection.
    async fn extend(&self, lock: &DistributedLock, _duration: Duration) -> Result<bool, LockError> {
        Ok(self
            .held
            .get(&lock.key)
            .map(|held| held.lock_value == lock.lock_value)
            .unwrap_or(false))
    }

    async fn release(&self, lock: &DistributedLock) -> Result<(), LockError> {
        let matches = self.held.get(&lock.key).map(|held| held.lock_value == lock.lock_value).unwrap_or(false);
        if !matches {
            return Ok(());
        }

        if let Some((_, mut held)) = self.held.remove(&lock.key) {
            let hashed = Self::hash_key(&lock.key);
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(hashed)
                .execute(&mut *held.conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}
