//! Storage boundary of the billing runner
//!
//! Every method that changes invoice status is conditional on the status the
//! runner expects, so two overlapping runs cannot both act on one invoice.

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{DueInvoice, NewInvoice, PaymentAttempt, PaymentMethod, Student};

/// Granted by a successful claim (PENDING -> CHARGING)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeClaim {
    /// Attempts recorded for the invoice at the moment of the claim
    pub attempts_made: u32,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub invoice_id: Uuid,
    pub attempt_no: i32,
    pub requested_at: OffsetDateTime,
}

/// Subscription advance applied together with a successful charge
#[derive(Debug, Clone)]
pub struct RollForward {
    pub subscription_id: Uuid,
    pub next_billing_date: Date,
    pub next_invoice: NewInvoice,
}

/// Everything written atomically after the gateway captured a payment
#[derive(Debug, Clone)]
pub struct ChargeSuccess {
    pub invoice_id: Uuid,
    pub attempt_id: Uuid,
    pub payment_key: String,
    pub paid_at: OffsetDateTime,
    pub roll_forward: Option<RollForward>,
}

#[derive(Debug, Clone)]
pub struct ChargeFailure {
    pub invoice_id: Uuid,
    pub attempt_id: Uuid,
    pub error_code: String,
    pub error_message: String,
    pub completed_at: OffsetDateTime,
    /// Final allowed attempt: the invoice becomes FAILED instead of PENDING
    pub terminal: bool,
}

/// Result of applying a success settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledSuccess {
    /// Paid and the next period's invoice was created
    RolledForward { next_invoice_id: Uuid },
    /// Paid; no subscription to advance (one-off invoice, or subscription
    /// canceled meanwhile)
    Paid,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// PENDING invoices due on or before `today` that have not been tried on
    /// `today`, oldest due date first.
    async fn due_invoices(&self, today: Date) -> BillingResult<Vec<DueInvoice>>;

    async fn students_by_ids(&self, ids: &[Uuid]) -> BillingResult<HashMap<Uuid, Student>>;

    /// Most recently created ACTIVE payment method of the student
    async fn current_payment_method(&self, student_id: Uuid)
        -> BillingResult<Option<PaymentMethod>>;

    /// PENDING -> FAILED for an invoice whose attempts are exhausted.
    /// Returns false if the invoice was no longer PENDING.
    async fn fail_exhausted_invoice(&self, invoice_id: Uuid) -> BillingResult<bool>;

    /// Conditional PENDING -> CHARGING, at most once per tenant day.
    /// `None` means another run owns the invoice or already tried it today.
    async fn claim_invoice(
        &self,
        invoice_id: Uuid,
        today: Date,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ChargeClaim>>;

    /// CHARGING -> PENDING when no gateway call was made after the claim
    async fn release_claim(&self, invoice_id: Uuid) -> BillingResult<()>;

    /// Insert a REQUESTED attempt. Must be durable before the gateway call.
    async fn record_attempt(&self, attempt: NewAttempt) -> BillingResult<PaymentAttempt>;

    async fn settle_success(&self, success: &ChargeSuccess) -> BillingResult<SettledSuccess>;

    async fn settle_failure(&self, failure: &ChargeFailure) -> BillingResult<()>;
}
