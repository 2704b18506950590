//! Postgres implementation of the notification queue

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::models::{NewNotification, Notification, NotificationStatus};
use crate::store::{NotificationStore, SendFailure};

const NOTIFICATION_COLUMNS: &str = r#"
    id, academy_id, template_code, recipient, variables, status, attempts, max_attempts,
    next_retry_at, provider_message_key, last_error_code, last_error_message,
    processed_at, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn claimable(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> NotificationResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notification_queue
            WHERE status = 'PENDING'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn claim(&self, row: &Notification, now: OffsetDateTime) -> NotificationResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'PROCESSING', updated_at = NOW()
            WHERE id = $1
              AND status = 'PENDING'
              AND attempts = $2
              AND (next_retry_at IS NULL OR next_retry_at <= $3)
            "#,
        )
        .bind(row.id)
        .bind(row.attempts)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_key: &str,
        now: OffsetDateTime,
    ) -> NotificationResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'SENT',
                attempts = attempts + 1,
                provider_message_key = $2,
                processed_at = $3,
                next_retry_at = NULL,
                last_error_code = NULL,
                last_error_message = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(provider_message_key)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(NotificationError::Storage(format!(
                "Notification {} was not PROCESSING when marked sent",
                id
            )));
        }
        Ok(())
    }

    async fn record_failure(&self, failure: &SendFailure) -> NotificationResult<()> {
        let status = if failure.terminal {
            NotificationStatus::Failed
        } else {
            NotificationStatus::Pending
        };

        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE notification_queue
            SET status = $2,
                attempts = attempts + 1,
                next_retry_at = $4,
                last_error_code = $5,
                last_error_message = $6,
                processed_at = CASE WHEN $7 THEN NOW() ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING' AND attempts + 1 = $3
            RETURNING attempts
            "#,
        )
        .bind(failure.id)
        .bind(status)
        .bind(failure.attempts)
        .bind(failure.next_retry_at)
        .bind(&failure.error_code)
        .bind(&failure.error_message)
        .bind(failure.terminal)
        .fetch_optional(&self.pool)
        .await?;

        match attempts {
            Some(_) => Ok(()),
            None => Err(NotificationError::Storage(format!(
                "Notification {} was not PROCESSING at attempt {} when failure was recorded",
                failure.id,
                failure.attempts - 1
            ))),
        }
    }

    async fn enqueue(
        &self,
        notification: &NewNotification,
        now: OffsetDateTime,
    ) -> NotificationResult<Notification> {
        notification.validate()?;

        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            INSERT INTO notification_queue
                (id, academy_id, template_code, recipient, variables, status,
                 max_attempts, next_retry_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(notification.academy_id)
        .bind(&notification.template_code)
        .bind(&notification.recipient)
        .bind(&notification.variables)
        .bind(notification.max_attempts)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn purge_sent(&self, older_than: OffsetDateTime) -> NotificationResult<u64> {
        let deleted = sqlx::query(
            "DELETE FROM notification_queue WHERE status = 'SENT' AND processed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}
