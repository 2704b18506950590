//! Notification queue worker
//!
//! One batch: select due PENDING rows, claim each with a conditional update,
//! send, then record the outcome. The claim only succeeds if the row is still
//! in the state it was selected in; a claim that affects zero rows means
//! another worker took or retried it, and the row is skipped. Delivery is at
//! most once: a row left PROCESSING by a crash is not picked up again
//! automatically.

use std::sync::Arc;

use academy_shared::{RetryDecision, RetryPolicy};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::error::{NotificationResult, ProviderError};
use crate::models::{NewNotification, Notification};
use crate::provider::{MessageProvider, OutboundMessage};
use crate::store::{NotificationStore, SendFailure};

pub const DEFAULT_BATCH_SIZE: i64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueRunSummary {
    pub processed: usize,
    pub succeeded: usize,
    /// Failed sends, whether or not the row will be retried
    pub failed: usize,
    pub skipped: usize,
}

pub struct NotificationWorker {
    store: Arc<dyn NotificationStore>,
    provider: Arc<dyn MessageProvider>,
    batch_size: i64,
}

impl NotificationWorker {
    pub fn new(store: Arc<dyn NotificationStore>, provider: Arc<dyn MessageProvider>) -> Self {
        Self {
            store,
            provider,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn process_due(&self) -> NotificationResult<QueueRunSummary> {
        self.process_batch(OffsetDateTime::now_utc()).await
    }

    pub async fn process_batch(&self, now: OffsetDateTime) -> NotificationResult<QueueRunSummary> {
        let rows = self.store.claimable(now, self.batch_size).await?;
        let mut summary = QueueRunSummary::default();

        for row in &rows {
            summary.processed += 1;

            match self.store.claim(row, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(notification_id = %row.id, "Notification claimed by another worker");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(notification_id = %row.id, error = %e, "Failed to claim notification");
                    summary.skipped += 1;
                    continue;
                }
            }

            match self.provider.send(&OutboundMessage::from(row)).await {
                Ok(message_key) => {
                    summary.succeeded += 1;
                    if let Err(e) = self.store.mark_sent(row.id, &message_key, now).await {
                        // Sent but not recorded: the row stays PROCESSING
                        error!(
                            notification_id = %row.id,
                            message_key = %message_key,
                            error = %e,
                            "Failed to mark notification sent"
                        );
                    }
                }
                Err(send_error) => {
                    summary.failed += 1;
                    self.handle_failure(row, &send_error, now).await;
                }
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Notification batch complete"
            );
        }

        Ok(summary)
    }

    async fn handle_failure(
        &self,
        row: &Notification,
        send_error: &ProviderError,
        now: OffsetDateTime,
    ) {
        let failure = failure_for(row, send_error, now);

        if failure.terminal {
            error!(
                audit = true,
                notification_id = %row.id,
                template_code = %row.template_code,
                attempts = failure.attempts,
                code = %failure.error_code,
                "Notification failed permanently"
            );
        } else {
            warn!(
                notification_id = %row.id,
                attempts = failure.attempts,
                error = %send_error,
                next_retry_at = ?failure.next_retry_at,
                "Notification send failed; rescheduled"
            );
        }

        if let Err(e) = self.store.record_failure(&failure).await {
            error!(notification_id = %row.id, error = %e, "Failed to record notification failure");
        }
    }

    /// Queue a notification for immediate delivery
    pub async fn enqueue(
        &self,
        notification: &NewNotification,
    ) -> NotificationResult<Notification> {
        notification.validate()?;
        let row = self
            .store
            .enqueue(notification, OffsetDateTime::now_utc())
            .await?;
        debug!(
            notification_id = %row.id,
            template_code = %row.template_code,
            "Notification queued"
        );
        Ok(row)
    }
}

/// Delete SENT rows older than the retention window. Needs no provider, so
/// housekeeping runs even when sending is disabled.
pub async fn purge_sent(
    store: &dyn NotificationStore,
    retention: Duration,
) -> NotificationResult<u64> {
    let cutoff = OffsetDateTime::now_utc() - retention;
    let deleted = store.purge_sent(cutoff).await?;
    info!(deleted, retention_days = retention.whole_days(), "Purged sent notifications");
    Ok(deleted)
}

/// Storage transition for a failed send of `row`
pub fn failure_for(
    row: &Notification,
    send_error: &ProviderError,
    now: OffsetDateTime,
) -> SendFailure {
    let attempts = row.attempts + 1;
    let policy = RetryPolicy::notifications(row.max_attempts.max(1) as u32);
    let next_retry_at = match policy.decide(attempts as u32, now) {
        RetryDecision::RetryAt(at) => Some(at),
        RetryDecision::RetryNextRun => Some(now),
        RetryDecision::GiveUp => None,
    };

    SendFailure {
        id: row.id,
        attempts,
        error_code: send_error.code().to_string(),
        error_message: send_error.message().to_string(),
        terminal: next_retry_at.is_none(),
        next_retry_at,
    }
}
