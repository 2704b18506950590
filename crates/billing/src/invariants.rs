//! Billing Invariants Module
//!
//! Runnable consistency checks over invoices, attempts and subscriptions.
//! The worker runs them daily; they can also be run by hand after a manual
//! data fix.
//!
//! Checks only read. A violation carries enough context (ids, counts,
//! timestamps) to find the rows involved.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Academies affected
    pub academy_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may have moved without being recorded, or may move twice
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultiplePendingRow {
    subscription_id: Uuid,
    academy_id: Uuid,
    open_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptCountRow {
    invoice_id: Uuid,
    academy_id: Uuid,
    attempt_count: i64,
    max_attempt_no: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleChargingRow {
    invoice_id: Uuid,
    academy_id: Uuid,
    order_id: String,
    charging_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingSuccessorRow {
    subscription_id: Uuid,
    academy_id: Uuid,
    invoice_id: Uuid,
    due_date: Date,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
    max_attempts: u32,
    stale_after: Duration,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: 3,
            stale_after: Duration::minutes(60),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Age after which a CHARGING invoice is reported
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: at most one open invoice per subscription
    ///
    /// The runner creates the next invoice only after the current one is
    /// paid. Two open invoices mean a period would be charged twice.
    async fn check_single_pending_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultiplePendingRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, academy_id, COUNT(*) AS open_count
            FROM invoices
            WHERE status IN ('PENDING', 'CHARGING')
              AND subscription_id IS NOT NULL
            GROUP BY subscription_id, academy_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_pending_invoice_per_subscription".to_string(),
                academy_ids: vec![row.academy_id],
                description: format!(
                    "Subscription {} has {} open invoices (expected at most 1)",
                    row.subscription_id, row.open_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "open_count": row.open_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: no invoice has more attempts than the configured ceiling
    async fn check_attempts_within_limit(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AttemptCountRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, i.academy_id,
                   COUNT(a.id) AS attempt_count, MAX(a.attempt_no) AS max_attempt_no
            FROM invoices i
            JOIN payment_attempts a ON a.invoice_id = i.id
            GROUP BY i.id, i.academy_id
            HAVING COUNT(a.id) > $1
            "#,
        )
        .bind(self.max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "attempts_within_limit".to_string(),
                academy_ids: vec![row.academy_id],
                description: format!(
                    "Invoice {} has {} payment attempts (limit {})",
                    row.invoice_id, row.attempt_count, self.max_attempts
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "attempt_count": row.attempt_count,
                    "max_attempt_no": row.max_attempt_no,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: attempt numbers run 1..=n without holes
    async fn check_attempt_numbers_gapless(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AttemptCountRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, i.academy_id,
                   COUNT(a.id) AS attempt_count, MAX(a.attempt_no) AS max_attempt_no
            FROM invoices i
            JOIN payment_attempts a ON a.invoice_id = i.id
            GROUP BY i.id, i.academy_id
            HAVING MAX(a.attempt_no) <> COUNT(a.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "attempt_numbers_gapless".to_string(),
                academy_ids: vec![row.academy_id],
                description: format!(
                    "Invoice {} has {} attempts but highest attempt number {}",
                    row.invoice_id, row.attempt_count, row.max_attempt_no
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "attempt_count": row.attempt_count,
                    "max_attempt_no": row.max_attempt_no,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: no invoice stays CHARGING past the stale threshold
    ///
    /// A stale claim is a charge whose outcome was never recorded. The
    /// gateway may have captured it, so it is never released automatically;
    /// someone has to look the order id up with the provider.
    async fn check_stale_charging(&self) -> BillingResult<Vec<InvariantViolation>> {
        let cutoff = OffsetDateTime::now_utc() - self.stale_after;
        let rows: Vec<StaleChargingRow> = sqlx::query_as(
            r#"
            SELECT id AS invoice_id, academy_id, order_id, charging_started_at
            FROM invoices
            WHERE status = 'CHARGING'
              AND (charging_started_at IS NULL OR charging_started_at < $1)
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_charging_invoices".to_string(),
                academy_ids: vec![row.academy_id],
                description: format!(
                    "Invoice {} has been CHARGING since {:?}; reconcile order {} with the gateway",
                    row.invoice_id, row.charging_started_at, row.order_id
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "order_id": row.order_id,
                    "charging_started_at": row.charging_started_at,
                    "stale_after_minutes": self.stale_after.whole_minutes(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: a live (ACTIVE or PAUSED) subscription whose latest
    /// invoice is PAID has a successor
    ///
    /// Missing successors mean the roll-forward was lost and the student
    /// silently stops being billed.
    async fn check_paid_invoice_has_successor(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingSuccessorRow> = sqlx::query_as(
            r#"
            SELECT s.id AS subscription_id, s.academy_id,
                   latest.id AS invoice_id, latest.due_date
            FROM student_subscriptions s
            JOIN LATERAL (
                SELECT i.id, i.status, i.due_date
                FROM invoices i
                WHERE i.subscription_id = s.id
                ORDER BY i.due_date DESC, i.created_at DESC
                LIMIT 1
            ) latest ON TRUE
            WHERE s.status <> 'CANCELED'
              AND latest.status = 'PAID'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_invoice_has_successor".to_string(),
                academy_ids: vec![row.academy_id],
                description: format!(
                    "Subscription {} has no invoice after paid invoice {} due {}",
                    row.subscription_id, row.invoice_id, row.due_date
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "invoice_id": row.invoice_id,
                    "due_date": row.due_date.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_pending_invoice_per_subscription" => self.check_single_pending_invoice().await,
            "attempts_within_limit" => self.check_attempts_within_limit().await,
            "attempt_numbers_gapless" => self.check_attempt_numbers_gapless().await,
            "stale_charging_invoices" => self.check_stale_charging().await,
            "paid_invoice_has_successor" => self.check_paid_invoice_has_successor().await,
            other => Err(BillingError::NotFound(format!("Invariant check {}", other))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_pending_invoice_per_subscription",
            "attempts_within_limit",
            "attempt_numbers_gapless",
            "stale_charging_invoices",
            "paid_invoice_has_successor",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            academy_ids: vec![Uuid::new_v4()],
            description: "test".to_string(),
            context: serde_json::json!({}),
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"stale_charging_invoices"));
        assert!(checks.contains(&"paid_invoice_has_successor"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_violations() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            5,
            vec![
                violation("attempts_within_limit"),
                violation("attempts_within_limit"),
                violation("stale_charging_invoices"),
            ],
        );

        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert_eq!(summary.violations.len(), 3);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), 5, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 5);
    }
}
