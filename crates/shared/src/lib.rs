#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Academy Shared
//!
//! Pieces used by both background jobs: the Postgres pool and embedded
//! migrations, the tenant clock, and the retry policy that decides whether a
//! failed unit of work is rescheduled or given up on.

pub mod clock;
pub mod db;
pub mod error;
pub mod retry;

pub use clock::TenantClock;
pub use db::{create_pool, run_migrations};
pub use error::{SharedError, SharedResult};
pub use retry::{RetryDecision, RetryPolicy, NOTIFICATION_BACKOFF};
