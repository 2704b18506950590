//! Billing error types

use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::models::{InvoiceStatus, SubscriptionStatus};

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invoice {invoice_id} cannot move from {from} to {to}")]
    InvalidTransition {
        invoice_id: Uuid,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("Subscription {subscription_id} cannot move from {from} to {to}")]
    InvalidSubscriptionTransition {
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("Student {student_id} already has a live subscription to plan {plan_id}")]
    AlreadyEnrolled { student_id: Uuid, plan_id: Uuid },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Plan {0} is not active")]
    InactivePlan(Uuid),

    #[error("Billing day {0} is outside 1-28")]
    InvalidBillingDay(i16),

    #[error("Date out of range: {0}")]
    DateOutOfRange(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Storage error: {0}")]
    Storage(String),
}
