//! Route cache selected at startup.

use chrono::{DateTime, Utc};
use routeminds_core::cache::{Cache, CacheError, Result};
use routeminds_core::environment::{Clock, SystemClock};
use routeminds_redis::RedisCache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Redis when `REDIS_URL` is set, process memory otherwise.
#[derive(Debug)]
pub enum RouteCache {
    /// Shared Redis cache
    Redis(RedisCache),
    /// Cache local to this worker process
    Memory(MemoryCache),
}

impl RouteCache {
    /// Connect to `redis_url`, or fall back to an in-memory cache when it is `None`.
    ///
    /// # Errors
    ///
    /// Returns the connection error if Redis is configured but unreachable.
    pub async fn connect(redis_url: Option<&str>) -> Result<Self> {
        match redis_url {
            Some(url) => Ok(Self::Redis(RedisCache::new(url).await?)),
            None => {
                tracing::warn!("REDIS_URL not set, caching route plans in process memory");
                Ok(Self::Memory(MemoryCache::new(Arc::new(SystemClock))))
            }
        }
    }

    /// Backend name for logs.
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Memory(_) => "memory",
        }
    }
}

impl Cache for RouteCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Redis(cache) => cache.get(key).await,
            Self::Memory(cache) => cache.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        match self {
            Self::Redis(cache) => cache.set(key, value, ttl).await,
            Self::Memory(cache) => cache.set(key, value, ttl).await,
        }
    }
}

/// Process-local cache with absolute expiration.
///
/// Route plans are written once and rarely read back, so every `set` drops
/// the entries that have already expired. The map never holds more than the
/// plans written within one TTL.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

struct Entry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl MemoryCache {
    /// Create an empty cache that expires entries against `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, expired ones included until the next `set`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Command(format!("TTL out of range: {e}")))?;
        let now = self.clock.now();

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = entries.len(), "Dropped expired route plans");
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}
