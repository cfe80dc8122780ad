//! Redis cache for route plans.
//!
//! Entries are written with `SET key value EX ttl`, so they expire a fixed
//! time after the write no matter how often they are read.
//!
//! # Example
//!
//! ```no_run
//! use routeminds_core::cache::Cache;
//! use routeminds_redis::RedisCache;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisCache::new("redis://127.0.0.1:6379").await?;
//! cache.set("route_1", b"{}", Duration::from_secs(3600)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use routeminds_core::cache::{Cache, CacheError, Result};
use std::time::Duration;

/// Redis-backed [`Cache`].
///
/// Clones share one multiplexed connection that reconnects on its own.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if the URL is invalid or the first
    /// connection fails.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Connection(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CacheError::Connection(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("Connected to Redis");
        Ok(Self { conn_manager })
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

/// `EX` takes whole, non-zero seconds: the TTL is rounded up.
fn expiry_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        conn.get(key)
            .await
            .map_err(|e| CacheError::Command(format!("GET {key} failed: {e}")))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let seconds = expiry_seconds(ttl);

        let _: () = conn
            .set_ex(key, value, seconds)
            .await
            .map_err(|e| CacheError::Command(format!("SET {key} EX {seconds} failed: {e}")))?;

        tracing::debug!(key, ttl_seconds = seconds, "Cache entry written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_rounds_up_to_whole_seconds() {
        assert_eq!(expiry_seconds(Duration::from_secs(3600)), 3600);
        assert_eq!(expiry_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(expiry_seconds(Duration::from_millis(1)), 1);
        assert_eq!(expiry_seconds(Duration::ZERO), 1);
    }
}
