//! Daily billing runner
//!
//! Charges every due PENDING invoice once per tenant day. Each invoice is
//! claimed (PENDING -> CHARGING) before the gateway is called, its attempt row
//! is written before the charge, and the outcome is settled in a single
//! store transaction. Invoices are processed one at a time; a failure on one
//! invoice is recorded in the summary and never aborts the batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use academy_shared::{RetryDecision, RetryPolicy, TenantClock};
use serde::Serialize;
use time::{Date, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, GatewayError, PaymentGateway};
use crate::models::{
    attempt_order_id, DueInvoice, NewInvoice, PaymentMethod, Student, SubscriptionStatus,
};
use crate::schedule::next_due_date;
use crate::store::{
    BillingStore, ChargeFailure, ChargeSuccess, NewAttempt, RollForward, SettledSuccess,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Counters of one run, returned to the scheduler for logging and alerting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BillingRunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// `"{invoice_id} attempt {n}: {code}: {message}"` per failed invoice
    pub errors: Vec<String>,
    /// `"{invoice_id}: {reason}"` per skipped invoice
    pub skip_reasons: Vec<String>,
}

impl BillingRunSummary {
    fn record(&mut self, invoice_id: Uuid, outcome: &InvoiceOutcome) {
        self.processed += 1;
        match outcome {
            InvoiceOutcome::Paid { .. } => self.succeeded += 1,
            InvoiceOutcome::Declined {
                attempt_no,
                code,
                message,
                ..
            } => {
                self.failed += 1;
                self.errors.push(format!(
                    "{} attempt {}: {}: {}",
                    invoice_id, attempt_no, code, message
                ));
            }
            InvoiceOutcome::Exhausted { attempts } => {
                self.failed += 1;
                self.errors.push(format!(
                    "{} attempt {}: ATTEMPTS_EXHAUSTED: no attempts left",
                    invoice_id, attempts
                ));
            }
            InvoiceOutcome::Skipped(reason) => {
                self.skipped += 1;
                self.skip_reasons.push(format!("{}: {}", invoice_id, reason));
            }
        }
    }

    fn record_error(&mut self, invoice_id: Uuid, error: &BillingError) {
        self.processed += 1;
        self.failed += 1;
        self.errors.push(format!("{}: {}", invoice_id, error));
    }
}

/// Why an invoice was left untouched by a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    SubscriptionNotActive(String),
    NoPaymentMethod,
    /// Another run holds the invoice or already tried it today
    AlreadyClaimed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SubscriptionNotActive(status) => {
                write!(f, "subscription is {}", status)
            }
            SkipReason::NoPaymentMethod => write!(f, "no active payment method"),
            SkipReason::AlreadyClaimed => write!(f, "claimed by another run"),
        }
    }
}

/// What happened to one invoice during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InvoiceOutcome {
    Paid {
        attempt_no: i32,
        next_invoice_id: Option<Uuid>,
    },
    Declined {
        attempt_no: i32,
        code: String,
        message: String,
        /// The invoice is now FAILED
        terminal: bool,
    },
    /// Marked FAILED without a new attempt
    Exhausted { attempts: usize },
    Skipped(SkipReason),
}

pub struct BillingRunner {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: RetryPolicy,
    clock: TenantClock,
}

impl BillingRunner {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            store,
            gateway,
            policy: RetryPolicy::daily(DEFAULT_MAX_ATTEMPTS),
            clock: TenantClock::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: TenantClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run for the current tenant day
    pub async fn run_for_today(&self) -> BillingResult<BillingRunSummary> {
        self.run(self.clock.today()).await
    }

    /// Charge every invoice due on or before `today`.
    ///
    /// Errors only if the due set or the students cannot be loaded. Per-invoice
    /// failures are reported in the summary.
    pub async fn run(&self, today: Date) -> BillingResult<BillingRunSummary> {
        let due = self.store.due_invoices(today).await?;
        let mut summary = BillingRunSummary::default();

        if due.is_empty() {
            debug!(%today, "No invoices due");
            return Ok(summary);
        }

        let student_ids: Vec<Uuid> = due
            .iter()
            .map(|d| d.invoice.student_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let students = self.store.students_by_ids(&student_ids).await?;

        info!(%today, due = due.len(), "Starting billing run");

        for item in &due {
            let invoice_id = item.invoice.id;
            match self.process_invoice(item, &students, today).await {
                Ok(outcome) => {
                    if let InvoiceOutcome::Skipped(reason) = &outcome {
                        info!(invoice_id = %invoice_id, reason = %reason, "Invoice skipped");
                    }
                    summary.record(invoice_id, &outcome);
                }
                Err(e) => {
                    error!(invoice_id = %invoice_id, error = %e, "Invoice processing failed");
                    summary.record_error(invoice_id, &e);
                }
            }
        }

        info!(
            %today,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Billing run complete"
        );

        Ok(summary)
    }

    async fn process_invoice(
        &self,
        item: &DueInvoice,
        students: &HashMap<Uuid, Student>,
        today: Date,
    ) -> BillingResult<InvoiceOutcome> {
        let invoice = &item.invoice;
        let attempts_seen = item.attempts.len();

        if self.policy.is_exhausted(attempts_seen as u32) {
            if self.store.fail_exhausted_invoice(invoice.id).await? {
                error!(
                    audit = true,
                    invoice_id = %invoice.id,
                    attempts = attempts_seen,
                    "Invoice failed permanently: attempts exhausted"
                );
                return Ok(InvoiceOutcome::Exhausted {
                    attempts: attempts_seen,
                });
            }
            return Ok(InvoiceOutcome::Skipped(SkipReason::AlreadyClaimed));
        }

        if let Some(sub) = &item.subscription {
            if !sub.status.bills() {
                return Ok(InvoiceOutcome::Skipped(SkipReason::SubscriptionNotActive(
                    sub.status.as_str().to_string(),
                )));
            }
        }

        let Some(method) = self.store.current_payment_method(invoice.student_id).await? else {
            return Ok(InvoiceOutcome::Skipped(SkipReason::NoPaymentMethod));
        };

        // Computed before the claim so a date error never follows a capture
        let roll_forward = self.roll_forward(item)?;

        let now = OffsetDateTime::now_utc();
        let Some(claim) = self.store.claim_invoice(invoice.id, today, now).await? else {
            return Ok(InvoiceOutcome::Skipped(SkipReason::AlreadyClaimed));
        };

        if self.policy.is_exhausted(claim.attempts_made) {
            // Attempts were added between the due query and the claim
            self.store.release_claim(invoice.id).await?;
            return Ok(InvoiceOutcome::Skipped(SkipReason::AlreadyClaimed));
        }

        let attempt_no = claim.attempts_made as i32 + 1;
        let attempt = match self
            .store
            .record_attempt(NewAttempt {
                invoice_id: invoice.id,
                attempt_no,
                requested_at: now,
            })
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                // Nothing was sent; hand the invoice back for the next run
                if let Err(release_err) = self.store.release_claim(invoice.id).await {
                    warn!(
                        invoice_id = %invoice.id,
                        error = %release_err,
                        "Failed to release claim"
                    );
                }
                return Err(e);
            }
        };

        let request = self.charge_request(item, &method, students, attempt_no);
        debug!(
            invoice_id = %invoice.id,
            attempt_no,
            order_id = %request.order_id,
            amount = invoice.amount,
            "Charging invoice"
        );

        match self.gateway.charge_with_billing_key(&request).await {
            Ok(receipt) => {
                let settled = self
                    .store
                    .settle_success(&ChargeSuccess {
                        invoice_id: invoice.id,
                        attempt_id: attempt.id,
                        payment_key: receipt.payment_key.clone(),
                        paid_at: OffsetDateTime::now_utc(),
                        roll_forward,
                    })
                    .await
                    .map_err(|e| {
                        error!(
                            audit = true,
                            invoice_id = %invoice.id,
                            payment_key = %receipt.payment_key,
                            error = %e,
                            "Charge captured but settlement failed; invoice left CHARGING"
                        );
                        e
                    })?;

                let next_invoice_id = match settled {
                    SettledSuccess::RolledForward { next_invoice_id } => Some(next_invoice_id),
                    SettledSuccess::Paid => None,
                };
                info!(
                    invoice_id = %invoice.id,
                    attempt_no,
                    payment_key = %receipt.payment_key,
                    next_invoice_id = ?next_invoice_id,
                    "Invoice paid"
                );
                Ok(InvoiceOutcome::Paid {
                    attempt_no,
                    next_invoice_id,
                })
            }
            Err(gateway_error) => {
                self.settle_decline(invoice.id, attempt.id, attempt_no, &gateway_error)
                    .await
            }
        }
    }

    async fn settle_decline(
        &self,
        invoice_id: Uuid,
        attempt_id: Uuid,
        attempt_no: i32,
        gateway_error: &GatewayError,
    ) -> BillingResult<InvoiceOutcome> {
        let now = OffsetDateTime::now_utc();
        let terminal = matches!(
            self.policy.decide(attempt_no as u32, now),
            RetryDecision::GiveUp
        );

        self.store
            .settle_failure(&ChargeFailure {
                invoice_id,
                attempt_id,
                error_code: gateway_error.code().to_string(),
                error_message: gateway_error.message().to_string(),
                completed_at: now,
                terminal,
            })
            .await?;

        if terminal {
            error!(
                audit = true,
                invoice_id = %invoice_id,
                attempt_no,
                code = gateway_error.code(),
                "Invoice failed permanently after final attempt"
            );
        } else {
            warn!(
                invoice_id = %invoice_id,
                attempt_no,
                known = gateway_error.is_known(),
                error = %gateway_error,
                "Charge failed; will retry on the next run"
            );
        }

        Ok(InvoiceOutcome::Declined {
            attempt_no,
            code: gateway_error.code().to_string(),
            message: gateway_error.message().to_string(),
            terminal,
        })
    }

    fn roll_forward(&self, item: &DueInvoice) -> BillingResult<Option<RollForward>> {
        let (Some(sub), Some(plan)) = (&item.subscription, &item.plan) else {
            return Ok(None);
        };
        // A pause while the charge is in flight still advances the period
        if sub.status == SubscriptionStatus::Canceled {
            return Ok(None);
        }

        let next_billing_date = next_due_date(item.invoice.due_date, plan.billing_day)?;
        Ok(Some(RollForward {
            subscription_id: sub.id,
            next_billing_date,
            next_invoice: NewInvoice::next_period(sub, plan, next_billing_date),
        }))
    }

    fn charge_request(
        &self,
        item: &DueInvoice,
        method: &PaymentMethod,
        students: &HashMap<Uuid, Student>,
        attempt_no: i32,
    ) -> ChargeRequest {
        let invoice = &item.invoice;
        let student = students.get(&invoice.student_id);
        ChargeRequest {
            billing_key: method.billing_key.clone(),
            customer_key: method.customer_key.clone(),
            amount: invoice.amount,
            order_id: attempt_order_id(&invoice.order_id, attempt_no),
            order_name: order_name(item),
            customer_name: student.map(|s| s.name.clone()),
            customer_email: student.and_then(|s| s.email.clone()),
        }
    }
}

/// Human-readable charge title, e.g. `Math Basic 2024-03`
pub fn order_name(item: &DueInvoice) -> String {
    let due = item.invoice.due_date;
    let title = item
        .plan
        .as_ref()
        .map(|p| p.name.as_str())
        .unwrap_or("Tuition");
    format!("{} {:04}-{:02}", title, due.year(), u8::from(due.month()))
}
