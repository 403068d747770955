//! Date range resolution
//!
//! Billing data settles with a delay, so the default run targets a single day
//! `lookback_days` in the past (T-2 by default). Backfill widens that to a
//! window ending on the same day; explicit dates replace the computed bounds.

use crate::error::{Error, Result};
use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;

/// Inclusive span of calendar days, `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Every day in the range, in order
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }

    pub fn len_days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// How the range was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Single day at `today - lookback_days`
    Default,
    /// `backfill_days` days ending at `today - lookback_days`
    Backfill,
    /// Exactly the given start and end
    Explicit,
}

impl RangeMode {
    /// Pick the mode from invocation flags: both dates given wins, then backfill.
    pub fn select(backfill: bool, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        match (start, end) {
            (Some(_), Some(_)) => RangeMode::Explicit,
            _ if backfill => RangeMode::Backfill,
            _ => RangeMode::Default,
        }
    }
}

/// Turns a mode plus optional explicit bounds into a concrete [`DateRange`]
#[derive(Debug, Clone, Copy)]
pub struct DateRangeResolver {
    lookback_days: i64,
    backfill_days: i64,
}

impl DateRangeResolver {
    pub fn new(lookback_days: i64, backfill_days: i64) -> Self {
        Self {
            lookback_days,
            backfill_days,
        }
    }

    /// Resolve against today's UTC date
    pub fn resolve(
        &self,
        mode: RangeMode,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<DateRange> {
        self.resolve_at(Utc::now().date_naive(), mode, start, end)
    }

    pub fn resolve_at(
        &self,
        today: NaiveDate,
        mode: RangeMode,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<DateRange> {
        if self.lookback_days <= 0 {
            return Err(Error::InvalidRange(format!(
                "lookback_days must be positive, got {}",
                self.lookback_days
            )));
        }
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(Error::InvalidRange(format!(
                    "start date {s} is after end date {e}"
                )));
            }
        }

        let range = match mode {
            RangeMode::Explicit => {
                let (Some(s), Some(e)) = (start, end) else {
                    return Err(Error::InvalidRange(
                        "explicit mode requires both a start and an end date".to_string(),
                    ));
                };
                DateRange::new(s, e)?
            }
            RangeMode::Default => {
                let end = match end {
                    Some(e) => e,
                    None => days_before(today, self.lookback_days)?,
                };
                DateRange::new(start.unwrap_or(end), end)?
            }
            RangeMode::Backfill => {
                if self.backfill_days <= 0 {
                    return Err(Error::InvalidRange(format!(
                        "backfill_days must be positive, got {}",
                        self.backfill_days
                    )));
                }
                let end = match end {
                    Some(e) => e,
                    None => days_before(today, self.lookback_days)?,
                };
                let start = match start {
                    Some(s) => s,
                    None => days_before(end, self.backfill_days - 1)?,
                };
                DateRange::new(start, end)?
            }
        };

        if range.end() > today {
            return Err(Error::InvalidRange(format!(
                "end date {} is in the future (today is {today})",
                range.end()
            )));
        }

        Ok(range)
    }
}

fn days_before(day: NaiveDate, n: i64) -> Result<NaiveDate> {
    day.checked_sub_days(Days::new(n as u64))
        .ok_or_else(|| Error::InvalidRange(format!("{n} days before {day} is out of range")))
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(input: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| Error::InvalidRange(format!("'{input}' is not a YYYY-MM-DD date: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn resolver() -> DateRangeResolver {
        DateRangeResolver::new(2, 90)
    }

    #[test]
    fn test_default_is_t_minus_two() {
        let range = resolver()
            .resolve_at(d("2024-03-10"), RangeMode::Default, None, None)
            .unwrap();
        assert_eq!(range.start(), d("2024-03-08"));
        assert_eq!(range.end(), d("2024-03-08"));
        assert_eq!(range.len_days(), 1);
    }

    #[test]
    fn test_backfill_spans_backfill_days() {
        let range = DateRangeResolver::new(2, 7)
            .resolve_at(d("2024-03-10"), RangeMode::Backfill, None, None)
            .unwrap();
        assert_eq!(range.start(), d("2024-03-02"));
        assert_eq!(range.end(), d("2024-03-08"));
        assert_eq!(range.len_days(), 7);
    }

    #[test]
    fn test_backfill_explicit_start_overrides() {
        let range = resolver()
            .resolve_at(d("2024-03-10"), RangeMode::Backfill, Some(d("2024-03-01")), None)
            .unwrap();
        assert_eq!(range.start(), d("2024-03-01"));
        assert_eq!(range.end(), d("2024-03-08"));
    }

    #[test]
    fn test_backfill_explicit_end_shifts_window() {
        let range = DateRangeResolver::new(2, 3)
            .resolve_at(d("2024-03-10"), RangeMode::Backfill, None, Some(d("2024-02-29")))
            .unwrap();
        assert_eq!(range.start(), d("2024-02-27"));
        assert_eq!(range.end(), d("2024-02-29"));
    }

    #[test]
    fn test_explicit_range() {
        let range = resolver()
            .resolve_at(
                d("2024-03-10"),
                RangeMode::Explicit,
                Some(d("2024-02-01")),
                Some(d("2024-02-29")),
            )
            .unwrap();
        assert_eq!(range.len_days(), 29);
        assert_eq!(range.days().count(), 29);
        assert_eq!(range.days().last(), Some(d("2024-02-29")));
    }

    #[test]
    fn test_explicit_requires_both_bounds() {
        let err = resolver()
            .resolve_at(d("2024-03-10"), RangeMode::Explicit, Some(d("2024-02-01")), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = resolver()
            .resolve_at(
                d("2024-03-10"),
                RangeMode::Explicit,
                Some(d("2024-03-05")),
                Some(d("2024-03-01")),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[test]
    fn test_future_end_rejected() {
        let err = resolver()
            .resolve_at(d("2024-03-10"), RangeMode::Default, None, Some(d("2024-03-11")))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));

        // today itself is allowed
        assert!(resolver()
            .resolve_at(d("2024-03-10"), RangeMode::Default, None, Some(d("2024-03-10")))
            .is_ok());
    }

    #[test]
    fn test_non_positive_day_counts_rejected() {
        let today = d("2024-03-10");
        assert!(DateRangeResolver::new(0, 90)
            .resolve_at(today, RangeMode::Default, None, None)
            .is_err());
        assert!(DateRangeResolver::new(-1, 90)
            .resolve_at(today, RangeMode::Default, None, None)
            .is_err());
        assert!(DateRangeResolver::new(2, 0)
            .resolve_at(today, RangeMode::Backfill, None, None)
            .is_err());
        // backfill_days only matters in backfill mode
        assert!(DateRangeResolver::new(2, 0)
            .resolve_at(today, RangeMode::Default, None, None)
            .is_ok());
    }

    #[test]
    fn test_mode_selection() {
        let s = Some(d("2024-01-01"));
        let e = Some(d("2024-01-31"));
        assert_eq!(RangeMode::select(true, s, e), RangeMode::Explicit);
        assert_eq!(RangeMode::select(true, s, None), RangeMode::Backfill);
        assert_eq!(RangeMode::select(false, None, e), RangeMode::Default);
    }

    #[test]
    fn test_parse_date_rejects_malformed() {
        assert!(parse_date("2024-13-01").is_err());
        assert!(parse_date("03/01/2024").is_err());
        assert!(parse_date("").is_err());
        assert_eq!(parse_date(" 2024-02-29 ").unwrap(), d("2024-02-29"));
    }

    #[test]
    fn test_range_contains_and_display() {
        let range = DateRange::new(d("2024-01-01"), d("2024-01-03")).unwrap();
        assert!(range.contains(d("2024-01-02")));
        assert!(!range.contains(d("2024-01-04")));
        assert_eq!(range.to_string(), "2024-01-01 to 2024-01-03");
    }
}
