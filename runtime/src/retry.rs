//! Retry policy for handling transient failures.
//!
//! The consumption harness retries a failed message a fixed number of times at
//! a fixed interval before giving up on it. A predicate decides which errors
//! are worth another attempt.
//!
//! # Example
//!
//! ```rust
//! use routeminds_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::fixed(5, Duration::from_millis(100));
//!
//! let value = retry_with_predicate(policy, || async { Ok::<_, String>(42) }, |_| true).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration.
///
/// `max_retries` counts retries after the first attempt, so a policy with
/// `max_retries = 5` runs an operation at most six times.
///
/// # Default Values
///
/// - `max_retries`: 5
/// - `interval`: 1 second
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Wait before every retry
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// A policy that waits the same `interval` before every retry.
    #[must_use]
    pub const fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Total number of attempts the policy allows, counting the first one.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (zero-based).
    #[must_use]
    pub const fn delay_for_attempt(&self, _retry: u32) -> Duration {
        self.interval
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt the policy allows failed. Carries the last error.
    Exhausted {
        /// Attempts made, counting the first one
        attempts: u32,
        /// Error from the final attempt
        error: E,
    },
    /// An attempt failed with an error the predicate refused to retry.
    Aborted {
        /// Attempts made, counting the failing one
        attempts: u32,
        /// The non-retryable error
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Aborted { attempts, .. } => *attempts,
        }
    }

    /// The error that ended the retry loop.
    #[must_use]
    pub const fn error(&self) -> &E {
        match self {
            Self::Exhausted { error, .. } | Self::Aborted { error, .. } => error,
        }
    }

    /// Take the error that ended the retry loop.
    #[must_use]
    pub fn into_error(self) -> E {
        match self {
            Self::Exhausted { error, .. } | Self::Aborted { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, error } => {
                write!(f, "gave up after {attempts} attempts: {error}")
            }
            Self::Aborted { attempts, error } => {
                write!(f, "non-retryable failure on attempt {attempts}: {error}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Retry an async operation, retrying only errors `is_retryable` accepts.
///
/// # Errors
///
/// - [`RetryError::Aborted`] as soon as an attempt fails with a non-retryable error
/// - [`RetryError::Exhausted`] when every attempt the policy allows has failed
///
/// # Example
///
/// ```rust
/// use routeminds_runtime::retry::{RetryError, RetryPolicy, retry_with_predicate};
///
/// # async fn example() {
/// let result = retry_with_predicate(
///     RetryPolicy::default(),
///     || async { Err::<i32, _>("permanent") },
///     |err: &&str| err.contains("transient"),
/// )
/// .await;
///
/// assert!(matches!(result, Err(RetryError::Aborted { attempts: 1, .. })));
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    tracing::info!(attempts, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !is_retryable(&error) {
                    tracing::warn!(attempts, error = %error, "Error is not retryable, failing immediately");
                    return Err(RetryError::Aborted { attempts, error });
                }

                if attempts >= policy.max_attempts() {
                    tracing::error!(attempts, error = %error, "Operation failed after max retries");
                    return Err(RetryError::Exhausted { attempts, error });
                }

                let delay = policy.delay_for_attempt(attempts - 1);
                tracing::warn!(
                    attempts,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
