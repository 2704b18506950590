//! In-memory queue store and scripted messaging provider

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult, ProviderError};
use crate::models::{NewNotification, Notification, NotificationStatus};
use crate::provider::{MessageProvider, OutboundMessage};
use crate::store::{NotificationStore, SendFailure};

#[derive(Default)]
pub struct MemoryNotificationStore {
    rows: Mutex<HashMap<Uuid, Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<Uuid, Notification>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, row: Notification) {
        self.rows().insert(row.id, row);
    }

    pub fn get(&self, id: Uuid) -> Option<Notification> {
        self.rows().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    fn processing<'a>(
        rows: &'a mut HashMap<Uuid, Notification>,
        id: Uuid,
    ) -> NotificationResult<&'a mut Notification> {
        match rows.get_mut(&id) {
            Some(row) if row.status == NotificationStatus::Processing => Ok(row),
            Some(_) => Err(NotificationError::Storage(format!(
                "Notification {} is not PROCESSING",
                id
            ))),
            None => Err(NotificationError::NotFound(format!("Notification {}", id))),
        }
    }
}

/// A stored PENDING row built from `new`, due at `now`
pub fn pending_row(new: &NewNotification, now: OffsetDateTime) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        academy_id: new.academy_id,
        template_code: new.template_code.clone(),
        recipient: new.recipient.clone(),
        variables: new.variables.clone(),
        status: NotificationStatus::Pending,
        attempts: 0,
        max_attempts: new.max_attempts,
        next_retry_at: Some(now),
        provider_message_key: None,
        last_error_code: None,
        last_error_message: None,
        processed_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn claimable(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> NotificationResult<Vec<Notification>> {
        tokio::task::yield_now().await;
        let mut due: Vec<Notification> = self
            .rows()
            .values()
            .filter(|r| r.status == NotificationStatus::Pending)
            .filter(|r| r.next_retry_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.created_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim(&self, row: &Notification, now: OffsetDateTime) -> NotificationResult<bool> {
        tokio::task::yield_now().await;
        match self.rows().get_mut(&row.id) {
            Some(stored)
                if stored.status == NotificationStatus::Pending
                    && stored.attempts == row.attempts
                    && stored.next_retry_at.map_or(true, |at| at <= now) =>
            {
                stored.status = NotificationStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_key: &str,
        now: OffsetDateTime,
    ) -> NotificationResult<()> {
        tokio::task::yield_now().await;
        let mut rows = self.rows();
        let row = Self::processing(&mut rows, id)?;
        row.status = NotificationStatus::Sent;
        row.attempts += 1;
        row.provider_message_key = Some(provider_message_key.to_string());
        row.processed_at = Some(now);
        row.next_retry_at = None;
        row.last_error_code = None;
        row.last_error_message = None;
        row.updated_at = now;
        Ok(())
    }

    async fn record_failure(&self, failure: &SendFailure) -> NotificationResult<()> {
        tokio::task::yield_now().await;
        let mut rows = self.rows();
        let row = Self::processing(&mut rows, failure.id)?;
        if row.attempts + 1 != failure.attempts {
            return Err(NotificationError::Storage(format!(
                "Notification {} was not PROCESSING at attempt {} when failure was recorded",
                failure.id,
                failure.attempts - 1
            )));
        }
        row.status = if failure.terminal {
            NotificationStatus::Failed
        } else {
            NotificationStatus::Pending
        };
        row.attempts += 1;
        row.next_retry_at = failure.next_retry_at;
        row.last_error_code = Some(failure.error_code.clone());
        row.last_error_message = Some(failure.error_message.clone());
        row.processed_at = failure.terminal.then(OffsetDateTime::now_utc);
        Ok(())
    }

    async fn enqueue(
        &self,
        notification: &NewNotification,
        now: OffsetDateTime,
    ) -> NotificationResult<Notification> {
        notification.validate()?;
        let row = pending_row(notification, now);
        self.insert(row.clone());
        Ok(row)
    }

    async fn purge_sent(&self, older_than: OffsetDateTime) -> NotificationResult<u64> {
        let mut rows = self.rows();
        let before = rows.len();
        rows.retain(|_, r| {
            let expired = r.processed_at.is_some_and(|at| at < older_than);
            !(r.status == NotificationStatus::Sent && expired)
        });
        Ok((before - rows.len()) as u64)
    }
}

/// Provider double answering from a queue of scripted outcomes; accepts
/// every message once the queue is empty.
#[derive(Default)]
pub struct ScriptedProvider {
    outcomes: Mutex<VecDeque<Result<String, ProviderError>>>,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, code: &str, message: &str) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(ProviderError::Rejected {
                code: code.to_string(),
                message: message.to_string(),
            }));
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageProvider for ScriptedProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
        let call_no = {
            let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
            sent.push(message.clone());
            sent.len()
        };
        tokio::task::yield_now().await;

        let scripted = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| Ok(format!("msg_{:03}", call_no)))
    }
}
