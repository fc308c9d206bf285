use redis::AsyncCommands;
use serde_json::Value;

use crate::models::cache::CacheRegion;

/// Redis-backed distributed tier (spec.md §4.B "distributed tier").
/// `redis::Client` is a thin handle around connection parameters, so
/// cloning is cheap and lets the same tier back both the cache manager
/// and components (e.g. the webhook circuit breaker) that need their
/// own `Arc`-shared handle.
#[derive(Clone)]
pub struct DistributedTier {
    client: redis::Client,
}

impl DistributedTier {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    fn key_for(region: CacheRegion, key: &str) -> String {
        format!("{}:{}", region.as_str(), key)
    }

    pub async fn get(&self, region: CacheRegion, key: &str) -> Result<Option<Value>, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(Self::key_for(region, key)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub async fn set(&self, region: CacheRegion, key: &str, value: &Value, ttl_secs: u64) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(value).unwrap_or_default();
        if ttl_secs == 0 {
            conn.set(Self::key_for(region, key), serialized).await
        } else {
            conn.set_ex(Self::key_for(region, key), serialized, ttl_secs).await
        }
    }

    pub async fn remove(&self, region: CacheRegion, key: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: u64 = conn.del(Self::key_for(region, key)).await?;
        Ok(removed > 0)
    }
}
