//! Dead Letter Queue (DLQ) for order messages.
//!
//! Stores messages that exhausted their retries, or could never be processed,
//! in the `failed_events` table so an operator can investigate, replay or
//! discard them.

use chrono::{DateTime, Utc};
use routeminds_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use routeminds_core::event::SerializedEvent;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Status of a failed event in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation or replay
    Pending,
    /// Being replayed
    Processing,
    /// Replayed successfully
    Resolved,
    /// Given up on for good
    Discarded,
}

impl DLQStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Storage(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// A row of the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// DLQ entry id
    pub id: i64,
    /// Topic the message was consumed from
    pub topic: String,
    /// The message as delivered
    pub event: SerializedEvent,
    /// Error from the last attempt
    pub error_message: String,
    /// Processing attempts made
    pub attempts: i32,
    /// When the first attempt failed
    pub first_failed_at: DateTime<Utc>,
    /// When the last attempt failed
    pub last_failed_at: DateTime<Utc>,
    /// Current status
    pub status: DLQStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use routeminds_postgres::{DLQStatus, PostgresDeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// if let Some(entry) = pending.first() {
///     dlq.update_status(entry.id, DLQStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

fn storage_error(e: sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(e.to_string())
}

impl PostgresDeadLetterQueue {
    /// Create a queue over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a dead letter and return its DLQ id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn add_entry(&self, entry: &DeadLetter) -> Result<i64, DeadLetterError> {
        let attempts = i32::try_from(entry.attempts).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                topic, event_type, event_data, metadata, error_message,
                attempts, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&entry.topic)
        .bind(&entry.event.event_type)
        .bind(&entry.event.data)
        .bind(entry.event.metadata.as_deref())
        .bind(&entry.error_message)
        .bind(attempts)
        .bind(entry.first_failed_at)
        .bind(entry.last_failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::warn!(
            dlq_id = id,
            topic = %entry.topic,
            event_type = %entry.event.event_type,
            error = %entry.error_message,
            attempts = entry.attempts,
            "Event added to Dead Letter Queue"
        );
        metrics::counter!("dlq.added", "event_type" => entry.event.event_type.clone()).increment(1);

        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: u32) -> Result<Vec<FailedEvent>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: u32,
    ) -> Result<Vec<FailedEvent>, DeadLetterError> {
        let rows = sqlx::query(
            r"
            SELECT id, topic, event_type, event_data, metadata, error_message,
                   attempts, first_failed_at, last_failed_at, status,
                   resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE status = $1
            ORDER BY first_failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// One entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<FailedEvent>, DeadLetterError> {
        let row = sqlx::query(
            r"
            SELECT id, topic, event_type, event_data, metadata, error_message,
                   attempts, first_failed_at, last_failed_at, status,
                   resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(Self::row_to_failed_event).transpose()
    }

    /// Set an entry's status.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DeadLetterError> {
        sqlx::query("UPDATE failed_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");
        Ok(())
    }

    /// Mark an entry as resolved, e.g. after a successful replay.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("dlq.resolved").increment(1);
        Ok(())
    }

    /// Mark an entry as permanently failed.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("dlq.discarded").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(count)
    }

    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedEvent, DeadLetterError> {
        let status: String = row.try_get("status").map_err(storage_error)?;

        Ok(FailedEvent {
            id: row.try_get("id").map_err(storage_error)?,
            topic: row.try_get("topic").map_err(storage_error)?,
            event: SerializedEvent::new(
                row.try_get("event_type").map_err(storage_error)?,
                row.try_get("event_data").map_err(storage_error)?,
                row.try_get("metadata").map_err(storage_error)?,
            ),
            error_message: row.try_get("error_message").map_err(storage_error)?,
            attempts: row.try_get("attempts").map_err(storage_error)?,
            first_failed_at: row.try_get("first_failed_at").map_err(storage_error)?,
            last_failed_at: row.try_get("last_failed_at").map_err(storage_error)?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(storage_error)?,
            resolved_by: row.try_get("resolved_by").map_err(storage_error)?,
            resolution_notes: row.try_get("resolution_notes").map_err(storage_error)?,
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn dead_letter(
        &self,
        entry: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move { self.add_entry(&entry).await.map(|_| ()) })
    }
}
