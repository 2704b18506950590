//! Tenant-local calendar
//!
//! Billing is keyed by the academy's calendar day, not the UTC day. Academies
//! run on a fixed offset (KST by default), so a plain `UtcOffset` is enough.

use time::{Date, OffsetDateTime, UtcOffset};

use crate::error::{SharedError, SharedResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantClock {
    offset: UtcOffset,
}

impl TenantClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Build a clock from a whole-hour offset such as `9` for KST
    pub fn from_hours(hours: i8) -> SharedResult<Self> {
        let offset =
            UtcOffset::from_hms(hours, 0, 0).map_err(|_| SharedError::InvalidOffset(hours))?;
        Ok(Self { offset })
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// The tenant's calendar date at `instant`
    pub fn date_at(&self, instant: OffsetDateTime) -> Date {
        instant.to_offset(self.offset).date()
    }

    pub fn today(&self) -> Date {
        self.date_at(OffsetDateTime::now_utc())
    }
}

impl Default for TenantClock {
    fn default() -> Self {
        Self {
            offset: UtcOffset::UTC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_kst_day_starts_at_fifteen_utc() {
        let clock = TenantClock::from_hours(9).unwrap();

        assert_eq!(
            clock.date_at(datetime!(2024-03-04 14:59:59 UTC)),
            date!(2024 - 03 - 04)
        );
        assert_eq!(
            clock.date_at(datetime!(2024-03-04 15:00:00 UTC)),
            date!(2024 - 03 - 05)
        );
    }

    #[test]
    fn test_negative_offset() {
        let clock = TenantClock::from_hours(-5).unwrap();
        assert_eq!(
            clock.date_at(datetime!(2024-03-05 03:00:00 UTC)),
            date!(2024 - 03 - 04)
        );
    }

    #[test]
    fn test_out_of_range_offset_rejected() {
        assert!(matches!(
            TenantClock::from_hours(26),
            Err(SharedError::InvalidOffset(26))
        ));
    }
}
