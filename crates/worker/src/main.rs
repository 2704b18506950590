// Allow unwrap/expect in test code only
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Academy Background Worker
//!
//! Handles scheduled jobs including:
//! - Daily tuition billing run (BILLING_CRON, default 00:05 KST)
//! - Notification queue processing (NOTIFICATION_CRON, default every minute)
//! - Billing invariant checks (daily at 1:00 AM UTC)
//! - Sent notification cleanup (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

mod config;

use std::sync::Arc;

use academy_billing::{
    BillingRunSummary, BillingRunner, InvariantCheckSummary, InvariantChecker, PgBillingStore,
    TossGateway,
};
use academy_notifications::{
    purge_sent, HttpMessageProvider, NotificationWorker, PgNotificationStore,
};
use academy_shared::{create_pool, run_migrations, RetryPolicy, TenantClock};
use time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const DEFAULT_LOG_FILTER: &str = "info,academy_billing=debug,academy_notifications=debug";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Log results of a billing run
fn log_billing_summary(summary: &BillingRunSummary) {
    info!(
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        "Billing run complete"
    );

    for line in &summary.errors {
        warn!(error = %line, "Billing charge failed");
    }
    for reason in &summary.skip_reasons {
        info!(reason = %reason, "Billing invoice skipped");
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants healthy");
        return;
    }

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            academies = violation.academy_ids.len(),
            context = %violation.context,
            "{}",
            violation.description
        );
    }
    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before the filter reads RUST_LOG
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Academy Worker");

    let config = Config::from_env()?;
    let clock = TenantClock::from_hours(config.tenant_utc_offset_hours)?;

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    let mut scheduler = JobScheduler::new().await?;
    let mut job_count = 0;
    let mut minimal_mode = false;

    // Job 1: Daily billing run
    // Only scheduled when the payment gateway is configured
    match TossGateway::from_env() {
        Ok(gateway) => {
            let runner = Arc::new(
                BillingRunner::new(
                    Arc::new(PgBillingStore::new(pool.clone())),
                    Arc::new(gateway),
                )
                .with_policy(RetryPolicy::daily(config.billing_max_attempts))
                .with_clock(clock),
            );

            scheduler
                .add(Job::new_async(config.billing_cron.as_str(), move |_uuid, _l| {
                    let runner = runner.clone();
                    Box::pin(async move {
                        info!("Running daily billing");
                        match runner.run_for_today().await {
                            Ok(summary) => log_billing_summary(&summary),
                            Err(e) => error!(error = %e, "Billing run aborted"),
                        }
                    })
                })?)
                .await?;
            job_count += 1;
            info!(cron = %config.billing_cron, "Scheduled: Daily billing run");
        }
        Err(e) => {
            warn!(error = %e, "Payment gateway not configured - billing run disabled");
            minimal_mode = true;
        }
    }

    // Job 2: Notification queue
    // Only scheduled when the messaging provider is configured
    let notification_store = Arc::new(PgNotificationStore::new(pool.clone()));
    match HttpMessageProvider::from_env() {
        Ok(provider) => {
            let worker = Arc::new(
                NotificationWorker::new(notification_store.clone(), Arc::new(provider))
                    .with_batch_size(config.notification_batch_size),
            );

            scheduler
                .add(Job::new_async(config.notification_cron.as_str(), move |_uuid, _l| {
                    let worker = worker.clone();
                    Box::pin(async move {
                        if let Err(e) = worker.process_due().await {
                            error!(error = %e, "Notification batch aborted");
                        }
                    })
                })?)
                .await?;
            job_count += 1;
            info!(cron = %config.notification_cron, "Scheduled: Notification queue");
        }
        Err(e) => {
            warn!(error = %e, "Messaging provider not configured - notification queue disabled");
            minimal_mode = true;
        }
    }

    // Job 3: Billing invariant checks (daily at 1:00 AM UTC)
    // Read-only, so it runs even without a gateway
    let checker = Arc::new(
        InvariantChecker::new(pool.clone())
            .with_max_attempts(config.billing_max_attempts)
            .with_stale_after(Duration::minutes(config.billing_stale_charge_minutes)),
    );
    scheduler
        .add(Job::new_async("0 0 1 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed"),
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Billing invariant checks (daily at 1:00 AM UTC)");

    // Job 4: Purge sent notifications (daily at 3:00 AM UTC)
    let retention = Duration::days(config.notification_retention_days);
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let store = notification_store.clone();
            Box::pin(async move {
                if let Err(e) = purge_sent(store.as_ref(), retention).await {
                    error!(error = %e, "Sent notification cleanup failed");
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!(
        retention_days = config.notification_retention_days,
        "Scheduled: Sent notification cleanup (daily at 3:00 AM UTC)"
    );

    // Job 5: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    job_count += 1;

    if minimal_mode {
        warn!(jobs = job_count, "Worker running in minimal mode");
    }

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!(jobs = job_count, "Academy Worker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
