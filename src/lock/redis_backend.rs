use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;

use crate::models::lock::DistributedLock;

use super::{DistributedLockBackend, LockError};

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed lock (spec.md §4.A "Distributed KV").
///
/// `acquire` uses `SET key value NX PX millis`; `extend`/`release` use
/// compare-and-set Lua scripts so the fencing check and the mutation
/// happen atomically on the server.
pub struct RedisLock {
    client: redis::Client,
}

impl RedisLock {
    pub fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url).map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    fn key_for(key: &str) -> String {
        format!("lock:{key}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl DistributedLockBackend for RedisLock {
    async fn acquire(&self, key: &str, expiry: Duration) -> Result<Option<DistributedLock>, LockError> {
        let mut conn = self.connection().await?;
        let lock_value = super::new_lock_value();
        let redis_key = Self::key_for(key);

        let set: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(&lock_value)
            .arg("NX")
            .arg("PX")
            .arg(expiry.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if set.is_none() {
            return Ok(None);
        }

        Ok(Some(DistributedLock {
            key: key.to_string(),
            lock_value,
            expires_at: Utc::now() + chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::seconds(60)),
        }))
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let exists: bool = conn
            .exists(Self::key_for(key))
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(exists)
    }

    async fn extend(&self, lock: &DistributedLock, duration: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(EXTEND_SCRIPT);
        let result: i32 = script
            .key(Self::key_for(&lock.key))
            .arg(&lock.lock_value)
            .arg(duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(result == 1)
    }

    async fn release(&self, lock: &DistributedLock) -> Result<(), LockError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(RELEASE_SCRIPT);
        let _: i32 = script
            .key(Self::key_for(&lock.key))
            .arg(&lock.lock_value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}
