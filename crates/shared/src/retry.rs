//! Retry policy shared by the billing runner and the notification queue
//!
//! Both jobs follow the same shape: claim a unit of work, attempt the external
//! call, then either reschedule it or give up. The policy only answers the last
//! question; the callers own the storage transitions.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

/// Delays between notification retries: 5 minutes, 30 minutes, 2 hours.
/// The last entry is reused once attempts exceed the table.
pub const NOTIFICATION_BACKOFF: [Duration; 3] = [
    Duration::minutes(5),
    Duration::minutes(30),
    Duration::minutes(120),
];

/// What to do with a unit of work after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetryDecision {
    /// Try again no earlier than the given instant
    RetryAt(OffsetDateTime),
    /// Try again on the next scheduled run, whenever that is
    RetryNextRun,
    /// Attempts exhausted; terminal failure
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Retry cadence is one scheduled run; no sub-run delay
    pub fn daily(max_attempts: u32) -> Self {
        Self::new(max_attempts, Vec::new())
    }

    pub fn notifications(max_attempts: u32) -> Self {
        Self::new(max_attempts, NOTIFICATION_BACKOFF.to_vec())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }

    /// Delay before the next try after `attempts_made` failures (1-based)
    pub fn delay_after(&self, attempts_made: u32) -> Option<Duration> {
        let last = self.backoff.last()?;
        let index = attempts_made.saturating_sub(1) as usize;
        Some(self.backoff.get(index).copied().unwrap_or(*last))
    }

    /// Decide the fate of a unit of work that has just failed its
    /// `attempts_made`-th attempt.
    pub fn decide(&self, attempts_made: u32, now: OffsetDateTime) -> RetryDecision {
        if self.is_exhausted(attempts_made) {
            return RetryDecision::GiveUp;
        }
        match self.delay_after(attempts_made) {
            Some(delay) => RetryDecision::RetryAt(now + delay),
            None => RetryDecision::RetryNextRun,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_notification_backoff_table() {
        let policy = RetryPolicy::notifications(3);
        let now = datetime!(2024-03-05 09:00 UTC);

        assert_eq!(
            policy.decide(1, now),
            RetryDecision::RetryAt(datetime!(2024-03-05 09:05 UTC))
        );
        assert_eq!(
            policy.decide(2, now),
            RetryDecision::RetryAt(datetime!(2024-03-05 09:30 UTC))
        );
        assert_eq!(policy.decide(3, now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_last_backoff_reused_past_table() {
        let policy = RetryPolicy::notifications(6);
        assert_eq!(policy.delay_after(3), Some(Duration::minutes(120)));
        assert_eq!(policy.delay_after(5), Some(Duration::minutes(120)));
        assert_eq!(
            policy.decide(5, datetime!(2024-03-05 09:00 UTC)),
            RetryDecision::RetryAt(datetime!(2024-03-05 11:00 UTC))
        );
    }

    #[test]
    fn test_daily_policy_waits_for_next_run() {
        let policy = RetryPolicy::daily(3);
        let now = datetime!(2024-03-05 00:05 UTC);

        assert_eq!(policy.decide(1, now), RetryDecision::RetryNextRun);
        assert_eq!(policy.decide(2, now), RetryDecision::RetryNextRun);
        assert_eq!(policy.decide(3, now), RetryDecision::GiveUp);
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn test_zero_attempts_uses_first_delay() {
        let policy = RetryPolicy::notifications(3);
        assert_eq!(policy.delay_after(0), Some(Duration::minutes(5)));
    }
}
