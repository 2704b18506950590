//! Tuition billing entities and their state machines

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// Status of a student's subscription to a tuition plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Paused => "PAUSED",
            SubscriptionStatus::Canceled => "CANCELED",
        }
    }

    /// Whether invoices of this subscription may be charged and rolled forward
    pub fn bills(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Active, Paused) | (Paused, Active) | (Active, Canceled) | (Paused, Canceled)
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Invoice lifecycle.
///
/// `Charging` is the transient claim state held while a gateway call is in
/// flight. `Paid`, `Failed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "invoice_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Charging,
    Paid,
    Failed,
    Canceled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Charging => "CHARGING",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Failed => "FAILED",
            InvoiceStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Failed | InvoiceStatus::Canceled
        )
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Pending, Charging)
                | (Pending, Failed)
                | (Pending, Canceled)
                | (Charging, Paid)
                | (Charging, Failed)
                | (Charging, Pending)
        )
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_attempt_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Requested,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethodStatus {
    Active,
    Revoked,
}

/// A recurring tuition price
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TuitionPlan {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub name: String,
    /// Amount in the smallest currency unit (won for KRW)
    pub amount: i64,
    pub currency: String,
    /// Day of month invoices fall due. New plans use 1-28; larger values are
    /// clamped to the end of short months.
    pub billing_day: i16,
    pub grace_days: i16,
    pub late_fee: Option<i64>,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudentSubscription {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub student_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub next_billing_date: Date,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// One billing period's obligation
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub student_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub due_date: Date,
    pub status: InvoiceStatus,
    /// Unique per invoice; the per-attempt gateway key is derived from it
    pub order_id: String,
    pub paid_at: Option<OffsetDateTime>,
    pub provider_payment_key: Option<String>,
    pub charging_started_at: Option<OffsetDateTime>,
    /// Tenant day of the most recent claim; an invoice is charged at most
    /// once per day.
    pub last_attempted_on: Option<Date>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// One gateway call against one invoice. Append-only apart from recording
/// the outcome of that call.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub attempt_no: i32,
    pub status: AttemptStatus,
    pub provider_transaction_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub requested_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// Gateway-issued stored card credential
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub student_id: Uuid,
    #[serde(skip_serializing)]
    pub billing_key: String,
    pub customer_key: String,
    pub card_label: Option<String>,
    pub status: PaymentMethodStatus,
    pub created_at: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Student {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

/// A due invoice with everything the runner needs to charge it
#[derive(Debug, Clone)]
pub struct DueInvoice {
    pub invoice: Invoice,
    pub plan: Option<TuitionPlan>,
    pub subscription: Option<StudentSubscription>,
    /// Prior attempts ordered by `attempt_no`
    pub attempts: Vec<PaymentAttempt>,
}

/// Fields of an invoice about to be inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub student_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub due_date: Date,
    pub order_id: String,
}

impl NewInvoice {
    /// The next period's invoice for a subscription, priced at the plan's
    /// current amount.
    pub fn next_period(
        subscription: &StudentSubscription,
        plan: &TuitionPlan,
        due_date: Date,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            academy_id: subscription.academy_id,
            student_id: subscription.student_id,
            subscription_id: Some(subscription.id),
            plan_id: Some(plan.id),
            amount: plan.amount,
            currency: plan.currency.clone(),
            due_date,
            order_id: new_order_id(due_date),
        }
    }
}

/// Generate a fresh invoice order id, e.g. `tuition-20240405-<32 hex>`
pub fn new_order_id(due_date: Date) -> String {
    format!(
        "tuition-{:04}{:02}{:02}-{}",
        due_date.year(),
        u8::from(due_date.month()),
        due_date.day(),
        Uuid::new_v4().simple()
    )
}

/// Gateway order id for one attempt of an invoice.
///
/// Transport-level retries of the same attempt reuse this key; the next
/// day's attempt gets a new one.
pub fn attempt_order_id(order_id: &str, attempt_no: i32) -> String {
    format!("{}-a{}", order_id, attempt_no)
}
