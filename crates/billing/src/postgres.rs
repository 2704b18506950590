//! Postgres implementation of the billing store

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    DueInvoice, Invoice, InvoiceStatus, NewInvoice, PaymentAttempt, PaymentMethod, Student,
    StudentSubscription, TuitionPlan,
};
use crate::store::{
    BillingStore, ChargeClaim, ChargeFailure, ChargeSuccess, NewAttempt, SettledSuccess,
};

const INVOICE_COLUMNS: &str = r#"
    id, academy_id, student_id, subscription_id, plan_id, amount, currency, due_date,
    status, order_id, paid_at, provider_payment_key, charging_started_at,
    last_attempted_on, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Insert an invoice inside an open transaction
pub(crate) async fn insert_invoice(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    invoice: &NewInvoice,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoices (
            id, academy_id, student_id, subscription_id, plan_id,
            amount, currency, due_date, status, order_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING', $9)
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.academy_id)
    .bind(invoice.student_id)
    .bind(invoice.subscription_id)
    .bind(invoice.plan_id)
    .bind(invoice.amount)
    .bind(&invoice.currency)
    .bind(invoice.due_date)
    .bind(&invoice.order_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn due_invoices(&self, today: Date) -> BillingResult<Vec<DueInvoice>> {
        let invoices: Vec<Invoice> = sqlx::query_as(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE status = 'PENDING'
              AND due_date <= $1
              AND (last_attempted_on IS NULL OR last_attempted_on < $1)
            ORDER BY due_date, created_at
            "#
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        if invoices.is_empty() {
            return Ok(Vec::new());
        }

        let invoice_ids: Vec<Uuid> = invoices.iter().map(|i| i.id).collect();
        let plan_ids: Vec<Uuid> = invoices.iter().filter_map(|i| i.plan_id).collect();
        let subscription_ids: Vec<Uuid> =
            invoices.iter().filter_map(|i| i.subscription_id).collect();

        let plans: Vec<TuitionPlan> =
            sqlx::query_as("SELECT * FROM tuition_plans WHERE id = ANY($1)")
                .bind(&plan_ids)
                .fetch_all(&self.pool)
                .await?;

        let subscriptions: Vec<StudentSubscription> = sqlx::query_as(
            r#"
            SELECT id, academy_id, student_id, plan_id, status, next_billing_date,
                   created_at, updated_at
            FROM student_subscriptions
            WHERE id = ANY($1)
            "#,
        )
        .bind(&subscription_ids)
        .fetch_all(&self.pool)
        .await?;

        let attempts: Vec<PaymentAttempt> = sqlx::query_as(
            r#"
            SELECT id, invoice_id, attempt_no, status, provider_transaction_id,
                   error_code, error_message, requested_at, completed_at
            FROM payment_attempts
            WHERE invoice_id = ANY($1)
            ORDER BY invoice_id, attempt_no
            "#,
        )
        .bind(&invoice_ids)
        .fetch_all(&self.pool)
        .await?;

        let plans: HashMap<Uuid, TuitionPlan> = plans.into_iter().map(|p| (p.id, p)).collect();
        let subscriptions: HashMap<Uuid, StudentSubscription> =
            subscriptions.into_iter().map(|s| (s.id, s)).collect();
        let mut attempts_by_invoice: HashMap<Uuid, Vec<PaymentAttempt>> = HashMap::new();
        for attempt in attempts {
            attempts_by_invoice
                .entry(attempt.invoice_id)
                .or_default()
                .push(attempt);
        }

        Ok(invoices
            .into_iter()
            .map(|invoice| DueInvoice {
                plan: invoice.plan_id.and_then(|id| plans.get(&id).cloned()),
                subscription: invoice
                    .subscription_id
                    .and_then(|id| subscriptions.get(&id).cloned()),
                attempts: attempts_by_invoice.remove(&invoice.id).unwrap_or_default(),
                invoice,
            })
            .collect())
    }

    async fn students_by_ids(&self, ids: &[Uuid]) -> BillingResult<HashMap<Uuid, Student>> {
        let students: Vec<Student> =
            sqlx::query_as("SELECT id, academy_id, name, email FROM students WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;

        Ok(students.into_iter().map(|s| (s.id, s)).collect())
    }

    async fn current_payment_method(
        &self,
        student_id: Uuid,
    ) -> BillingResult<Option<PaymentMethod>> {
        let method = sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT id, academy_id, student_id, billing_key, customer_key, card_label,
                   status, created_at, revoked_at
            FROM payment_methods
            WHERE student_id = $1 AND status = 'ACTIVE'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(method)
    }

    async fn fail_exhausted_invoice(&self, invoice_id: Uuid) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'FAILED', updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn claim_invoice(
        &self,
        invoice_id: Uuid,
        today: Date,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ChargeClaim>> {
        let attempts_made: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE invoices
            SET status = 'CHARGING',
                charging_started_at = $3,
                last_attempted_on = $2,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'PENDING'
              AND (last_attempted_on IS NULL OR last_attempted_on < $2)
            RETURNING (
                SELECT COUNT(*) FROM payment_attempts a WHERE a.invoice_id = invoices.id
            )
            "#,
        )
        .bind(invoice_id)
        .bind(today)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attempts_made.map(|n| ChargeClaim {
            attempts_made: n.max(0) as u32,
        }))
    }

    async fn release_claim(&self, invoice_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'PENDING', charging_started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'CHARGING'
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> BillingResult<PaymentAttempt> {
        let record = sqlx::query_as::<_, PaymentAttempt>(
            r#"
            INSERT INTO payment_attempts (id, invoice_id, attempt_no, status, requested_at)
            VALUES ($1, $2, $3, 'REQUESTED', $4)
            RETURNING id, invoice_id, attempt_no, status, provider_transaction_id,
                      error_code, error_message, requested_at, completed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(attempt.invoice_id)
        .bind(attempt.attempt_no)
        .bind(attempt.requested_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn settle_success(&self, success: &ChargeSuccess) -> BillingResult<SettledSuccess> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE payment_attempts
            SET status = 'SUCCESS', provider_transaction_id = $2, completed_at = $3
            WHERE id = $1
            "#,
        )
        .bind(success.attempt_id)
        .bind(&success.payment_key)
        .bind(success.paid_at)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'PAID',
                paid_at = $2,
                provider_payment_key = $3,
                charging_started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'CHARGING'
            "#,
        )
        .bind(success.invoice_id)
        .bind(success.paid_at)
        .bind(&success.payment_key)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            // Dropping the transaction rolls back the attempt update
            return Err(BillingError::ConcurrentModification(format!(
                "Invoice {} left CHARGING before settlement",
                success.invoice_id
            )));
        }

        let mut outcome = SettledSuccess::Paid;
        if let Some(roll) = &success.roll_forward {
            let advanced = sqlx::query(
                r#"
                UPDATE student_subscriptions
                SET next_billing_date = $2, updated_at = NOW()
                WHERE id = $1 AND status <> 'CANCELED'
                "#,
            )
            .bind(roll.subscription_id)
            .bind(roll.next_billing_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if advanced == 1 {
                insert_invoice(&mut tx, &roll.next_invoice).await?;
                outcome = SettledSuccess::RolledForward {
                    next_invoice_id: roll.next_invoice.id,
                };
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn settle_failure(&self, failure: &ChargeFailure) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE payment_attempts
            SET status = 'FAILED', error_code = $2, error_message = $3, completed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(failure.attempt_id)
        .bind(&failure.error_code)
        .bind(&failure.error_message)
        .bind(failure.completed_at)
        .execute(&mut *tx)
        .await?;

        let next_status = if failure.terminal {
            InvoiceStatus::Failed
        } else {
            InvoiceStatus::Pending
        };
        let rows = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, charging_started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'CHARGING'
            "#,
        )
        .bind(failure.invoice_id)
        .bind(next_status)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "Invoice {} left CHARGING before failure was recorded",
                failure.invoice_id
            )));
        }

        tx.commit().await?;
        Ok(())
    }
}
