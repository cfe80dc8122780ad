//! Dead-letter destination.
//!
//! Messages that exhausted their retry budget, or can never be processed, are
//! parked here so they stop blocking the subscription.

use crate::event::SerializedEvent;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors writing to a dead-letter destination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// Storage backend error.
    #[error("Dead letter storage error: {0}")]
    Storage(String),
}

/// A message that will not be processed further without intervention.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Topic the message was consumed from.
    pub topic: String,
    /// The event as delivered.
    pub event: SerializedEvent,
    /// Error from the last attempt.
    pub error_message: String,
    /// Number of processing attempts made.
    pub attempts: u32,
    /// When the first attempt failed.
    pub first_failed_at: DateTime<Utc>,
    /// When the last attempt failed.
    pub last_failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
///
/// Uses boxed futures so the consumer can hold it as `Arc<dyn DeadLetterSink>`.
pub trait DeadLetterSink: Send + Sync {
    /// Record a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the entry cannot be stored.
    fn dead_letter(
        &self,
        entry: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
