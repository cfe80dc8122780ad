use chrono::{DateTime, Utc};
use routeminds_core::cache::{Cache, CacheError, Result};
use routeminds_core::environment::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// In-memory cache with absolute expiration.
///
/// Expiry is evaluated against the injected clock, so tests can step past a TTL
/// with a [`ManualClock`](crate::ManualClock) instead of sleeping. Expired entries
/// are dropped lazily on read.
///
/// Clones share the same entries.
#[derive(Clone)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    failing_sets: Arc<AtomicU32>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl InMemoryCache {
    /// Create a cache that expires entries against the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a cache that expires entries against `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            failing_sets: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `n` calls to `set` fail.
    pub fn fail_next_sets(&self, n: u32) {
        self.failing_sets.store(n, Ordering::SeqCst);
    }

    /// When the entry under `key` expires, if one is stored (expired or not).
    #[must_use]
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|entry| entry.expires_at)
    }

    /// Check if a live entry exists under `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|entry| entry.expires_at > now)
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("InMemoryCache").field("entries", &len).finish()
    }
}

impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        if self
            .failing_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CacheError::Connection("injected cache failure".to_string()));
        }

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Command(format!("TTL out of range: {e}")))?;
        let entry = Entry {
            value: value.to_vec(),
            expires_at: self.clock.now() + ttl,
        };

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mocks::{ManualClock, test_epoch};

    #[tokio::test]
    async fn entry_expires_at_absolute_deadline() {
        let clock = ManualClock::new(test_epoch());
        let cache = InMemoryCache::with_clock(Arc::new(clock.clone()));

        cache
            .set("route_1", b"plan", Duration::from_secs(3600))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3599));
        assert_eq!(cache.get("route_1").await.unwrap(), Some(b"plan".to_vec()));

        // Reads do not extend the deadline.
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("route_1").await.unwrap(), None);
        assert!(!cache.contains_key("route_1"));
    }

    #[tokio::test]
    async fn set_overwrites_and_restarts_ttl() {
        let clock = ManualClock::new(test_epoch());
        let cache = InMemoryCache::with_clock(Arc::new(clock.clone()));

        cache.set("k", b"a", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(5));
        cache.set("k", b"b", Duration::from_secs(10)).await.unwrap();

        assert_eq!(
            cache.expires_at("k"),
            Some(test_epoch() + chrono::Duration::seconds(15))
        );
        assert_eq!(cache.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn injected_failure_fails_set_once() {
        let cache = InMemoryCache::new();
        cache.fail_next_sets(1);
        assert!(cache.set("k", b"v", Duration::from_secs(1)).await.is_err());
        assert!(cache.set("k", b"v", Duration::from_secs(1)).await.is_ok());
    }
}
