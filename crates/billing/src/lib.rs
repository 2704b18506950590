// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries sqlx::Error by value
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Academy Billing Module
//!
//! Recurring tuition billing: invoices are charged against stored card
//! billing keys once per tenant day, retried on later days up to a fixed
//! number of attempts, and rolled forward to the next month on success.
//!
//! ## Features
//!
//! - **Daily Runner**: Claim, attempt and settle every due invoice
//! - **Toss Gateway**: Billing-key charges with per-attempt idempotency keys
//! - **Subscriptions**: Enroll, pause, resume, cancel, payment methods
//! - **Invariants**: Read-only consistency checks over billing tables

pub mod error;
pub mod gateway;
pub mod invariants;
pub mod models;
pub mod postgres;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod subscriptions;
pub mod toss;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;


// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{ChargeReceipt, ChargeRequest, GatewayError, PaymentGateway};
pub use toss::{TossConfig, TossGateway};

// Models
pub use models::{
    AttemptStatus, DueInvoice, Invoice, InvoiceStatus, NewInvoice, PaymentAttempt, PaymentMethod,
    PaymentMethodStatus, Student, StudentSubscription, SubscriptionStatus, TuitionPlan,
};

// Runner
pub use runner::{BillingRunSummary, BillingRunner, InvoiceOutcome, SkipReason};

// Schedule
pub use schedule::{first_due_date, next_due_date};

// Store
pub use postgres::PgBillingStore;
pub use store::BillingStore;

// Subscriptions
pub use subscriptions::{
    CancellationResult, EnrollRequest, Enrollment, NewPaymentMethod, SubscriptionService,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use std::sync::Arc;

use academy_shared::{RetryPolicy, TenantClock};
use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub runner: BillingRunner,
    pub subscriptions: SubscriptionService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service with the Toss gateway configured from
    /// environment variables
    pub fn from_env(
        pool: PgPool,
        policy: RetryPolicy,
        clock: TenantClock,
    ) -> BillingResult<Self> {
        let gateway = TossGateway::from_env()?;
        Ok(Self::new(pool, Arc::new(gateway), policy, clock))
    }

    /// Create a new billing service with an explicit gateway
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        policy: RetryPolicy,
        clock: TenantClock,
    ) -> Self {
        let max_attempts = policy.max_attempts();
        Self {
            runner: BillingRunner::new(Arc::new(PgBillingStore::new(pool.clone())), gateway)
                .with_policy(policy)
                .with_clock(clock),
            subscriptions: SubscriptionService::new(pool.clone()),
            invariants: InvariantChecker::new(pool).with_max_attempts(max_attempts),
        }
    }
}
