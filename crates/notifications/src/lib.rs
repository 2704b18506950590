// Allow unwrap/expect in test code only
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Academy Notifications
//!
//! Outbound message queue for guardian alerts. Rows are written PENDING,
//! claimed one at a time by the queue worker, handed to the messaging
//! provider, and then marked SENT or rescheduled on the backoff table until
//! their attempts run out.

pub mod error;
pub mod models;
pub mod postgres;
pub mod provider;
pub mod store;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;


pub use error::{NotificationError, NotificationResult, ProviderError};
pub use models::{
    attendance_alert, AttendanceEvent, NewNotification, Notification, NotificationStatus,
    ATTENDANCE_ALERT_TEMPLATE,
};
pub use postgres::PgNotificationStore;
pub use provider::{HttpMessageProvider, MessageProvider, OutboundMessage, ProviderConfig};
pub use store::{NotificationStore, SendFailure};
pub use worker::{purge_sent, NotificationWorker, QueueRunSummary, DEFAULT_BATCH_SIZE};
