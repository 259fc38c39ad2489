//! Logical (calendar) dates for job runs.

use core::str::FromStr;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The calendar date a job run represents.
///
/// Distinct from the wall-clock instant the run actually executed: a run for
/// `2025-11-10` may start shortly after midnight on the 11th.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalDate(NaiveDate);

impl LogicalDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Today's date in UTC.
    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Self, DomainError> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| DomainError::invalid_date(format!("{year:04}-{month:02}-{day:02}")))
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl From<NaiveDate> for LogicalDate {
    fn from(value: NaiveDate) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for LogicalDate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for LogicalDate {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Self)
            .map_err(|e| DomainError::invalid_date(format!("{s}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso_calendar_dates() {
        let date: LogicalDate = "2025-11-10".parse().unwrap();
        assert_eq!(date, LogicalDate::from_ymd(2025, 11, 10).unwrap());
        assert_eq!(date.to_string(), "2025-11-10");
    }

    #[test]
    fn rejects_timestamps_and_impossible_dates() {
        assert!("2025-11-10T00:00:00Z".parse::<LogicalDate>().is_err());
        assert!("2025-02-30".parse::<LogicalDate>().is_err());
        assert!(LogicalDate::from_ymd(2025, 13, 1).is_err());
    }
}
