//! Key-value cache with per-entry absolute expiration.
//!
//! The cache is a read-optimized side channel. A miss means "not computed yet" or
//! "expired", never "does not exist": readers fall back to the durable record.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors from cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache backend could not be reached.
    #[error("Cache connection error: {0}")]
    Connection(String),

    /// The backend rejected the command.
    #[error("Cache command failed: {0}")]
    Command(String),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// A byte-valued cache keyed by string.
pub trait Cache: Send + Sync {
    /// Read a live entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Write an entry that expires `ttl` after this call, regardless of reads.
    ///
    /// Overwrites any existing entry under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
}
