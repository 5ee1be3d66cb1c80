//! Redis Fast Cache Adapter
//!
//! Implements the `FastCache` port over a deadpool-managed Redis pool. The
//! conditional-expiry counter runs as a Lua script so that creating the key
//! and setting its expiry happen in one server-side step.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Pool, Runtime};
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::ports::{FastCache, KeyTtl};
use crate::error::{Error, Result};

/// INCR, and PEXPIRE only when this increment created the key.
static INCR_WITH_EXPIRY: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#,
    )
});

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
    /// Wait / create / recycle timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            timeout_ms: 2000,
        }
    }
}

impl RedisConfig {
    /// Build a connection pool. No connection is opened until first use.
    pub fn create_pool(&self) -> Result<Pool> {
        let timeout = Duration::from_millis(self.timeout_ms);
        let mut config = deadpool_redis::Config::from_url(&self.url);
        let mut pool_config = deadpool_redis::PoolConfig::new(self.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        config.pool = Some(pool_config);

        config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("Failed to create Redis pool: {}", e)))
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Fast cache backed by Redis.
#[derive(Clone)]
pub struct RedisFastCache {
    pool: Pool,
}

impl RedisFastCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build the pool from `config` and verify it with a PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let cache = Self::new(config.create_pool()?);
        cache.ping().await?;
        info!(url = %config.url, "Connected to Redis");
        Ok(cache)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl FastCache for RedisFastCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.pool.get().await?;
        match ttl {
            Some(ttl) => {
                let () = conn.pset_ex(key, value.as_ref(), millis(ttl)).await?;
            }
            None => {
                let () = conn.set(key, value.as_ref()).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let count: i64 = conn.incr(key, 1).await?;
        Ok(count)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let count: i64 = INCR_WITH_EXPIRY
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.pool.get().await?;
        let remaining: i64 = conn.pttl(key).await?;
        Ok(match remaining {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let previous: bool = conn.setbit(key, offset as usize, value).await?;
        Ok(previous)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hset_with_expiry(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let () = redis::pipe()
            .atomic()
            .hset(key, field, value)
            .ignore()
            .pexpire(key, millis(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.ping().await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.pool_size, 16);
    }

    #[tokio::test]
    async fn test_pool_builds_without_connecting() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 100,
            ..Default::default()
        };
        let cache = RedisFastCache::new(config.create_pool().unwrap());

        // Nothing listens on port 1
        assert!(!cache.health_check().await.unwrap());
        assert!(matches!(cache.get("k").await, Err(Error::CacheUnavailable(_))));
    }

    #[test]
    fn test_sub_millisecond_ttl_rounds_up() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(3)), 3000);
    }
}
