//! Billing calendar arithmetic
//!
//! Rule for billing days that do not exist in a month (29-31 in February,
//! 31 in 30-day months): clamp to the last valid day of that month. The
//! clamp is applied per month, so a plan billed on the 31st resumes on the
//! 31st after a short month.

use time::{util::days_in_year_month, Date, Month};

use crate::error::{BillingError, BillingResult};

/// Days new plans may be billed on; every month has them.
pub const BILLING_DAY_RANGE: std::ops::RangeInclusive<i16> = 1..=28;

pub fn validate_billing_day(billing_day: i16) -> BillingResult<()> {
    if BILLING_DAY_RANGE.contains(&billing_day) {
        Ok(())
    } else {
        Err(BillingError::InvalidBillingDay(billing_day))
    }
}

/// The billing day inside a given month, clamped to the month's length
pub fn billing_date_in(year: i32, month: Month, billing_day: i16) -> BillingResult<Date> {
    let last = days_in_year_month(year, month);
    let day = (billing_day.clamp(1, 31) as u8).min(last);
    Date::from_calendar_date(year, month, day)
        .map_err(|e| BillingError::DateOutOfRange(e.to_string()))
}

/// Due date of the period after `current_due`: the following calendar month,
/// on the plan's billing day.
pub fn next_due_date(current_due: Date, billing_day: i16) -> BillingResult<Date> {
    let month = current_due.month().next();
    let year = if month == Month::January {
        current_due.year() + 1
    } else {
        current_due.year()
    };
    billing_date_in(year, month, billing_day)
}

/// First due date on or after `starts_on` for a new subscription
pub fn first_due_date(starts_on: Date, billing_day: i16) -> BillingResult<Date> {
    let candidate = billing_date_in(starts_on.year(), starts_on.month(), billing_day)?;
    if candidate >= starts_on {
        Ok(candidate)
    } else {
        next_due_date(candidate, billing_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_same_day_next_month() {
        assert_eq!(
            next_due_date(date!(2024 - 03 - 05), 5).unwrap(),
            date!(2024 - 04 - 05)
        );
    }

    #[test]
    fn test_billing_day_31_clamps_into_leap_february() {
        assert_eq!(
            next_due_date(date!(2024 - 01 - 31), 31).unwrap(),
            date!(2024 - 02 - 29)
        );
    }

    #[test]
    fn test_billing_day_31_clamps_into_common_february() {
        assert_eq!(
            next_due_date(date!(2023 - 01 - 31), 31).unwrap(),
            date!(2023 - 02 - 28)
        );
    }

    #[test]
    fn test_clamped_day_recovers_after_short_month() {
        let feb = next_due_date(date!(2024 - 01 - 31), 31).unwrap();
        assert_eq!(next_due_date(feb, 31).unwrap(), date!(2024 - 03 - 31));

        let apr = next_due_date(date!(2024 - 03 - 31), 31).unwrap();
        assert_eq!(apr, date!(2024 - 04 - 30));
    }

    #[test]
    fn test_december_rolls_into_next_year() {
        assert_eq!(
            next_due_date(date!(2024 - 12 - 15), 15).unwrap(),
            date!(2025 - 01 - 15)
        );
    }

    #[test]
    fn test_changed_billing_day_applies_to_next_month() {
        assert_eq!(
            next_due_date(date!(2024 - 03 - 05), 20).unwrap(),
            date!(2024 - 04 - 20)
        );
    }

    #[test]
    fn test_first_due_date() {
        assert_eq!(
            first_due_date(date!(2024 - 03 - 02), 5).unwrap(),
            date!(2024 - 03 - 05)
        );
        assert_eq!(
            first_due_date(date!(2024 - 03 - 05), 5).unwrap(),
            date!(2024 - 03 - 05)
        );
        assert_eq!(
            first_due_date(date!(2024 - 03 - 06), 5).unwrap(),
            date!(2024 - 04 - 05)
        );
    }

    #[test]
    fn test_validate_billing_day() {
        assert!(validate_billing_day(1).is_ok());
        assert!(validate_billing_day(28).is_ok());
        assert!(matches!(
            validate_billing_day(29),
            Err(BillingError::InvalidBillingDay(29))
        ));
        assert!(validate_billing_day(0).is_err());
    }
}
