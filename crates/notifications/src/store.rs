//! Storage boundary of the queue worker

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::NotificationResult;
use crate::models::{NewNotification, Notification};

/// Outcome of one failed send, applied to a PROCESSING row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub id: Uuid,
    /// Attempts including the one that just failed
    pub attempts: i32,
    pub error_code: String,
    pub error_message: String,
    /// `None` together with `terminal = true`
    pub next_retry_at: Option<OffsetDateTime>,
    pub terminal: bool,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Up to `limit` PENDING rows due at `now`, oldest first
    async fn claimable(&self, now: OffsetDateTime, limit: i64)
        -> NotificationResult<Vec<Notification>>;

    /// Conditional PENDING -> PROCESSING, only while the row is still in the
    /// state `row` was read in (same attempt count, due at `now`). False
    /// means another worker claimed or retried it since.
    async fn claim(&self, row: &Notification, now: OffsetDateTime) -> NotificationResult<bool>;

    /// PROCESSING -> SENT, clearing the last error
    async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_key: &str,
        now: OffsetDateTime,
    ) -> NotificationResult<()>;

    /// PROCESSING -> PENDING (with `next_retry_at`) or FAILED. The stored
    /// attempt count is incremented and must land on `failure.attempts`.
    async fn record_failure(&self, failure: &SendFailure) -> NotificationResult<()>;

    /// Insert a PENDING row due immediately
    async fn enqueue(
        &self,
        notification: &NewNotification,
        now: OffsetDateTime,
    ) -> NotificationResult<Notification>;

    /// Delete SENT rows processed before `older_than`
    async fn purge_sent(&self, older_than: OffsetDateTime) -> NotificationResult<u64>;
}
