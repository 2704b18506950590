//! Subscription administration
//!
//! Enrollment and the administrator actions that put subscriptions, invoices
//! and payment methods into the states the billing runner consumes. Every
//! status change is a conditional update on the expected current status; a
//! zero-row update is resolved into `NotFound` or an invalid-transition error.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Invoice, InvoiceStatus, NewInvoice, PaymentMethod, StudentSubscription, SubscriptionStatus,
    TuitionPlan,
};
use crate::postgres::insert_invoice;

const SUBSCRIPTION_COLUMNS: &str =
    "id, academy_id, student_id, plan_id, status, next_billing_date, created_at, updated_at";

const PAYMENT_METHOD_COLUMNS: &str = "id, academy_id, student_id, billing_key, customer_key, \
     card_label, status, created_at, revoked_at";

/// Enrollment of a student in a tuition plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub academy_id: Uuid,
    pub student_id: Uuid,
    pub plan_id: Uuid,
    /// Due date of the first invoice; usually `schedule::first_due_date`
    pub first_due_date: Date,
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub subscription: StudentSubscription,
    pub first_invoice_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationResult {
    pub subscription: StudentSubscription,
    /// PENDING invoices of the subscription that were canceled with it
    pub canceled_invoices: u64,
}

/// A billing key issued by the gateway after card registration
#[derive(Debug, Clone, Deserialize)]
pub struct NewPaymentMethod {
    pub academy_id: Uuid,
    pub student_id: Uuid,
    pub billing_key: String,
    pub customer_key: String,
    pub card_label: Option<String>,
}

/// Enrollment is allowed only for an active plan of the same academy
pub fn check_enrollable(plan: &TuitionPlan, academy_id: Uuid) -> BillingResult<()> {
    if plan.academy_id != academy_id {
        return Err(BillingError::NotFound(format!("Plan {}", plan.id)));
    }
    if !plan.active {
        return Err(BillingError::InactivePlan(plan.id));
    }
    Ok(())
}

/// Resolve a zero-row subscription update into the right error
fn subscription_transition_error(
    subscription_id: Uuid,
    current: Option<SubscriptionStatus>,
    to: SubscriptionStatus,
) -> BillingError {
    match current {
        None => BillingError::NotFound(format!("Subscription {}", subscription_id)),
        Some(from) => BillingError::InvalidSubscriptionTransition {
            subscription_id,
            from,
            to,
        },
    }
}

fn invoice_transition_error(
    invoice_id: Uuid,
    current: Option<InvoiceStatus>,
    to: InvoiceStatus,
) -> BillingError {
    match current {
        None => BillingError::NotFound(format!("Invoice {}", invoice_id)),
        Some(from) => BillingError::InvalidTransition {
            invoice_id,
            from,
            to,
        },
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create an ACTIVE subscription and its first PENDING invoice atomically
    pub async fn enroll(&self, request: EnrollRequest) -> BillingResult<Enrollment> {
        let plan: TuitionPlan = sqlx::query_as("SELECT * FROM tuition_plans WHERE id = $1")
            .bind(request.plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", request.plan_id)))?;
        check_enrollable(&plan, request.academy_id)?;

        let mut tx = self.pool.begin().await?;

        let subscription: StudentSubscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO student_subscriptions
                (id, academy_id, student_id, plan_id, status, next_billing_date)
            VALUES ($1, $2, $3, $4, 'ACTIVE', $5)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.academy_id)
        .bind(request.student_id)
        .bind(request.plan_id)
        .bind(request.first_due_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::AlreadyEnrolled {
                    student_id: request.student_id,
                    plan_id: request.plan_id,
                }
            } else {
                BillingError::Database(e)
            }
        })?;

        let first = NewInvoice::next_period(&subscription, &plan, request.first_due_date);
        insert_invoice(&mut tx, &first).await?;
        tx.commit().await?;

        info!(
            subscription_id = %subscription.id,
            student_id = %subscription.student_id,
            plan_id = %plan.id,
            first_due_date = %request.first_due_date,
            "Student enrolled"
        );

        Ok(Enrollment {
            subscription,
            first_invoice_id: first.id,
        })
    }

    /// ACTIVE -> PAUSED. The runner skips invoices of paused subscriptions.
    pub async fn pause(&self, subscription_id: Uuid) -> BillingResult<StudentSubscription> {
        self.transition(
            subscription_id,
            SubscriptionStatus::Active,
            SubscriptionStatus::Paused,
        )
        .await
    }

    /// PAUSED -> ACTIVE. A PENDING invoice that fell due while paused is
    /// charged on the next run.
    pub async fn resume(&self, subscription_id: Uuid) -> BillingResult<StudentSubscription> {
        self.transition(
            subscription_id,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Active,
        )
        .await
    }

    /// Cancel a subscription together with its PENDING invoices.
    ///
    /// An invoice that is CHARGING at the moment of cancellation settles
    /// normally, but no successor is created for it.
    pub async fn cancel(&self, subscription_id: Uuid) -> BillingResult<CancellationResult> {
        let mut tx = self.pool.begin().await?;

        let subscription: Option<StudentSubscription> = sqlx::query_as(&format!(
            r#"
            UPDATE student_subscriptions
            SET status = 'CANCELED', updated_at = NOW()
            WHERE id = $1 AND status <> 'CANCELED'
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(subscription) = subscription else {
            let current = self.subscription_status(subscription_id).await?;
            return Err(subscription_transition_error(
                subscription_id,
                current,
                SubscriptionStatus::Canceled,
            ));
        };

        let canceled_invoices = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'CANCELED', updated_at = NOW()
            WHERE subscription_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(
            subscription_id = %subscription_id,
            canceled_invoices,
            "Subscription canceled"
        );

        Ok(CancellationResult {
            subscription,
            canceled_invoices,
        })
    }

    /// PENDING -> CANCELED for a single invoice
    pub async fn cancel_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice: Option<Invoice> = sqlx::query_as(
            r#"
            UPDATE invoices
            SET status = 'CANCELED', updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING id, academy_id, student_id, subscription_id, plan_id, amount, currency,
                      due_date, status, order_id, paid_at, provider_payment_key,
                      charging_started_at, last_attempted_on, created_at, updated_at
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        match invoice {
            Some(invoice) => {
                info!(invoice_id = %invoice_id, "Invoice canceled");
                Ok(invoice)
            }
            None => {
                let current: Option<InvoiceStatus> =
                    sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
                        .bind(invoice_id)
                        .fetch_optional(&self.pool)
                        .await?;
                Err(invoice_transition_error(
                    invoice_id,
                    current,
                    InvoiceStatus::Canceled,
                ))
            }
        }
    }

    /// Store a newly issued billing key. It becomes the student's current
    /// method; older ACTIVE methods are kept until revoked.
    pub async fn register_payment_method(
        &self,
        method: NewPaymentMethod,
    ) -> BillingResult<PaymentMethod> {
        if method.billing_key.trim().is_empty() || method.customer_key.trim().is_empty() {
            return Err(BillingError::Config(
                "billing_key and customer_key are required".to_string(),
            ));
        }

        let record: PaymentMethod = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_methods
                (id, academy_id, student_id, billing_key, customer_key, card_label, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'ACTIVE')
            RETURNING {PAYMENT_METHOD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(method.academy_id)
        .bind(method.student_id)
        .bind(&method.billing_key)
        .bind(&method.customer_key)
        .bind(&method.card_label)
        .fetch_one(&self.pool)
        .await?;

        info!(
            payment_method_id = %record.id,
            student_id = %record.student_id,
            "Payment method registered"
        );
        Ok(record)
    }

    pub async fn revoke_payment_method(
        &self,
        payment_method_id: Uuid,
    ) -> BillingResult<PaymentMethod> {
        let record: Option<PaymentMethod> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_methods
            SET status = 'REVOKED', revoked_at = $2
            WHERE id = $1 AND status = 'ACTIVE'
            RETURNING {PAYMENT_METHOD_COLUMNS}
            "#
        ))
        .bind(payment_method_id)
        .bind(OffsetDateTime::now_utc())
        .fetch_optional(&self.pool)
        .await?;

        let record = record.ok_or_else(|| {
            BillingError::NotFound(format!("Active payment method {}", payment_method_id))
        })?;
        info!(payment_method_id = %payment_method_id, "Payment method revoked");
        Ok(record)
    }

    async fn transition(
        &self,
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    ) -> BillingResult<StudentSubscription> {
        let updated: Option<StudentSubscription> = sqlx::query_as(&format!(
            r#"
            UPDATE student_subscriptions
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(subscription) => {
                info!(
                    subscription_id = %subscription_id,
                    from = %from,
                    to = %to,
                    "Subscription status changed"
                );
                Ok(subscription)
            }
            None => {
                let current = self.subscription_status(subscription_id).await?;
                Err(subscription_transition_error(subscription_id, current, to))
            }
        }
    }

    async fn subscription_status(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<SubscriptionStatus>> {
        let status = sqlx::query_scalar("SELECT status FROM student_subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }
}
