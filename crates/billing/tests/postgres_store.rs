//! Postgres-backed store tests
//!
//! Run with a database: `DATABASE_URL=postgres://... cargo test -- --ignored`

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use academy_billing::test_support::ScriptedGateway;
use academy_billing::{
    BillingError, BillingRunner, BillingStore, ChargeReceipt, ChargeRequest, EnrollRequest,
    GatewayError, InvariantChecker, InvoiceStatus, NewPaymentMethod, PaymentGateway,
    PgBillingStore, SubscriptionService, SubscriptionStatus,
};
use async_trait::async_trait;
use sqlx::PgPool;
use time::macros::date;
use time::OffsetDateTime;
use uuid::Uuid;

struct Fixture {
    academy_id: Uuid,
    student_id: Uuid,
    plan_id: Uuid,
}

async fn seed_plan(pool: &PgPool, billing_day: i16, active: bool) -> Fixture {
    let academy_id = Uuid::new_v4();
    let student_id = Uuid::new_v4();
    let plan_id = Uuid::new_v4();

    sqlx::query("INSERT INTO students (id, academy_id, name, email) VALUES ($1, $2, $3, $4)")
        .bind(student_id)
        .bind(academy_id)
        .bind("Kim Minji")
        .bind("parent@example.com")
        .execute(pool)
        .await
        .unwrap();

    sqlx::query(
        r#"
        INSERT INTO tuition_plans (id, academy_id, name, amount, currency, billing_day, active)
        VALUES ($1, $2, 'Math Basic', 50000, 'KRW', $3, $4)
        "#,
    )
    .bind(plan_id)
    .bind(academy_id)
    .bind(billing_day)
    .bind(active)
    .execute(pool)
    .await
    .unwrap();

    Fixture {
        academy_id,
        student_id,
        plan_id,
    }
}

async fn enroll_with_card(pool: &PgPool, fixture: &Fixture, first_due: time::Date) -> Uuid {
    let service = SubscriptionService::new(pool.clone());
    service
        .register_payment_method(NewPaymentMethod {
            academy_id: fixture.academy_id,
            student_id: fixture.student_id,
            billing_key: "bk_test".to_string(),
            customer_key: "cust_test".to_string(),
            card_label: None,
        })
        .await
        .unwrap();

    service
        .enroll(EnrollRequest {
            academy_id: fixture.academy_id,
            student_id: fixture.student_id,
            plan_id: fixture.plan_id,
            first_due_date: first_due,
        })
        .await
        .unwrap()
        .first_invoice_id
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_run_pays_and_rolls_forward(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;

    let runner = BillingRunner::new(
        Arc::new(PgBillingStore::new(pool.clone())),
        Arc::new(ScriptedGateway::new()),
    );
    let summary = runner.run(date!(2024 - 03 - 05)).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let status: InvoiceStatus = sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
        .bind(invoice_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, InvoiceStatus::Paid);

    let next_due: time::Date = sqlx::query_scalar(
        "SELECT due_date FROM invoices WHERE student_id = $1 AND status = 'PENDING'",
    )
    .bind(fixture.student_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(next_due, date!(2024 - 04 - 05));

    // Same day again: nothing due
    let summary = runner.run(date!(2024 - 03 - 05)).await.unwrap();
    assert_eq!(summary.processed, 0);
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_claim_is_exclusive(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let store = PgBillingStore::new(pool.clone());
    let now = OffsetDateTime::now_utc();
    let today = date!(2024 - 03 - 05);

    let (a, b) = tokio::join!(
        store.claim_invoice(invoice_id, today, now),
        store.claim_invoice(invoice_id, today, now)
    );
    let granted = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(granted, 1);

    assert!(store.due_invoices(today).await.unwrap().is_empty());
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_cancel_cascades_to_pending_invoices(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let service = SubscriptionService::new(pool.clone());

    let subscription_id: Uuid =
        sqlx::query_scalar("SELECT subscription_id FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_one(&pool)
            .await
            .unwrap();

    let paused = service.pause(subscription_id).await.unwrap();
    assert_eq!(paused.status, SubscriptionStatus::Paused);
    assert!(matches!(
        service.pause(subscription_id).await,
        Err(BillingError::InvalidSubscriptionTransition { .. })
    ));

    let result = service.cancel(subscription_id).await.unwrap();
    assert_eq!(result.canceled_invoices, 1);
    assert!(matches!(
        service.cancel_invoice(invoice_id).await,
        Err(BillingError::InvalidTransition {
            from: InvoiceStatus::Canceled,
            ..
        })
    ));
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_enroll_rejects_inactive_plan_and_duplicates(pool: PgPool) {
    let inactive = seed_plan(&pool, 5, false).await;
    let service = SubscriptionService::new(pool.clone());
    let request = EnrollRequest {
        academy_id: inactive.academy_id,
        student_id: inactive.student_id,
        plan_id: inactive.plan_id,
        first_due_date: date!(2024 - 03 - 05),
    };
    assert!(matches!(
        service.enroll(request).await,
        Err(BillingError::InactivePlan(_))
    ));

    let fixture = seed_plan(&pool, 5, true).await;
    enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let again = service
        .enroll(EnrollRequest {
            academy_id: fixture.academy_id,
            student_id: fixture.student_id,
            plan_id: fixture.plan_id,
            first_due_date: date!(2024 - 04 - 05),
        })
        .await;
    assert!(matches!(again, Err(BillingError::AlreadyEnrolled { .. })));
}

// Invariant checks: each test seeds exactly one violation

async fn subscription_of(pool: &PgPool, invoice_id: Uuid) -> Uuid {
    sqlx::query_scalar("SELECT subscription_id FROM invoices WHERE id = $1")
        .bind(invoice_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn insert_attempts(pool: &PgPool, invoice_id: Uuid, attempt_numbers: &[i32]) {
    for attempt_no in attempt_numbers {
        sqlx::query(
            r#"
            INSERT INTO payment_attempts (id, invoice_id, attempt_no, status, requested_at)
            VALUES ($1, $2, $3, 'FAILED', NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice_id)
        .bind(attempt_no)
        .execute(pool)
        .await
        .unwrap();
    }
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_invariant_reports_second_open_invoice(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let checker = InvariantChecker::new(pool.clone());
    let name = "single_pending_invoice_per_subscription";
    assert!(checker.run_check(name).await.unwrap().is_empty());

    sqlx::query(
        r#"
        INSERT INTO invoices
            (id, academy_id, student_id, subscription_id, plan_id, amount, currency,
             due_date, status, order_id)
        SELECT $1, academy_id, student_id, subscription_id, plan_id, amount, currency,
               due_date + 31, 'PENDING', order_id || '-dup'
        FROM invoices WHERE id = $2
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(invoice_id)
    .execute(&pool)
    .await
    .unwrap();

    let violations = checker.run_check(name).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].academy_ids, vec![fixture.academy_id]);
    assert_eq!(violations[0].context["open_count"], 2);
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_invariant_reports_attempts_over_limit(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let checker = InvariantChecker::new(pool.clone());

    insert_attempts(&pool, invoice_id, &[1, 2, 3]).await;
    assert!(checker.run_check("attempts_within_limit").await.unwrap().is_empty());

    insert_attempts(&pool, invoice_id, &[4]).await;
    let violations = checker.run_check("attempts_within_limit").await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].context["attempt_count"], 4);
    assert!(checker.run_check("attempt_numbers_gapless").await.unwrap().is_empty());
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_invariant_reports_attempt_number_gap(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    insert_attempts(&pool, invoice_id, &[1, 3]).await;

    let violations = InvariantChecker::new(pool.clone())
        .run_check("attempt_numbers_gapless")
        .await
        .unwrap();

    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].context["invoice_id"], invoice_id.to_string());
    assert_eq!(violations[0].context["max_attempt_no"], 3);
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_invariant_reports_stale_charging_invoice(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let checker = InvariantChecker::new(pool.clone());
    let mark_charging = |age: &'static str| {
        let pool = pool.clone();
        async move {
            sqlx::query(&format!(
                "UPDATE invoices SET status = 'CHARGING', \
                 charging_started_at = NOW() - INTERVAL '{age}' WHERE id = $1"
            ))
            .bind(invoice_id)
            .execute(&pool)
            .await
            .unwrap();
        }
    };

    // Recent claims are in flight, not stale
    mark_charging("5 minutes").await;
    assert!(checker.run_check("stale_charging_invoices").await.unwrap().is_empty());

    mark_charging("2 hours").await;
    let violations = checker.run_check("stale_charging_invoices").await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].context["invoice_id"], invoice_id.to_string());
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_invariant_reports_paid_invoice_without_successor(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let subscription_id = subscription_of(&pool, invoice_id).await;
    let checker = InvariantChecker::new(pool.clone());
    let name = "paid_invoice_has_successor";

    let runner = BillingRunner::new(
        Arc::new(PgBillingStore::new(pool.clone())),
        Arc::new(ScriptedGateway::new()),
    );
    runner.run(date!(2024 - 03 - 05)).await.unwrap();
    assert!(checker.run_check(name).await.unwrap().is_empty());

    sqlx::query("DELETE FROM invoices WHERE subscription_id = $1 AND status = 'PENDING'")
        .bind(subscription_id)
        .execute(&pool)
        .await
        .unwrap();

    // Paused subscriptions still need their next invoice waiting
    SubscriptionService::new(pool.clone())
        .pause(subscription_id)
        .await
        .unwrap();
    let violations = checker.run_check(name).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].context["invoice_id"], invoice_id.to_string());

    // Canceled subscriptions never get a successor
    sqlx::query("UPDATE student_subscriptions SET status = 'CANCELED' WHERE id = $1")
        .bind(subscription_id)
        .execute(&pool)
        .await
        .unwrap();
    assert!(checker.run_check(name).await.unwrap().is_empty());
}

/// Pauses the subscription while its charge is in flight
struct PausingGateway {
    pool: PgPool,
    subscription_id: Uuid,
}

#[async_trait]
impl PaymentGateway for PausingGateway {
    async fn charge_with_billing_key(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, GatewayError> {
        SubscriptionService::new(self.pool.clone())
            .pause(self.subscription_id)
            .await
            .unwrap();
        Ok(ChargeReceipt {
            payment_key: "pay_inflight".to_string(),
            order_id: request.order_id.clone(),
        })
    }
}

#[sqlx::test(migrations = "../shared/migrations")]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn test_pause_during_charge_keeps_successor(pool: PgPool) {
    let fixture = seed_plan(&pool, 5, true).await;
    let invoice_id = enroll_with_card(&pool, &fixture, date!(2024 - 03 - 05)).await;
    let subscription_id = subscription_of(&pool, invoice_id).await;

    let runner = BillingRunner::new(
        Arc::new(PgBillingStore::new(pool.clone())),
        Arc::new(PausingGateway {
            pool: pool.clone(),
            subscription_id,
        }),
    );
    let summary = runner.run(date!(2024 - 03 - 05)).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let (status, next_billing_date): (SubscriptionStatus, time::Date) = sqlx::query_as(
        "SELECT status, next_billing_date FROM student_subscriptions WHERE id = $1",
    )
    .bind(subscription_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, SubscriptionStatus::Paused);
    assert_eq!(next_billing_date, date!(2024 - 04 - 05));

    let successors: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM invoices WHERE subscription_id = $1 AND status = 'PENDING'",
    )
    .bind(subscription_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(successors, 1);
    assert!(InvariantChecker::new(pool.clone())
        .run_check("paid_invoice_has_successor")
        .await
        .unwrap()
        .is_empty());
}
