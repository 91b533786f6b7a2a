//! Closed date ranges over epoch days.
//!
//! Dates are plain `i32` day counts since the Unix epoch; open ends are the
//! extreme sentinel values. Ranges are cheap `Copy` values, used per event
//! on the query hot path.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Day count since 1970-01-01.
pub type EpochDay = i32;

/// Open lower bound sentinel.
pub const NEGATIVE_INFINITY: EpochDay = i32::MIN;
/// Open upper bound sentinel.
pub const POSITIVE_INFINITY: EpochDay = i32::MAX;

/// A closed date range `[min, max]` with optionally open ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    min: EpochDay,
    max: EpochDay,
}

impl DateRange {
    /// Range covering exactly the given days. `min` must not exceed `max`.
    pub fn of(min: EpochDay, max: EpochDay) -> Self {
        debug_assert!(min <= max, "inverted date range {min}..{max}");
        Self { min, max }
    }

    /// Single-day range.
    pub fn exactly(day: EpochDay) -> Self {
        Self { min: day, max: day }
    }

    /// Range open towards the past.
    pub fn at_most(max: EpochDay) -> Self {
        Self {
            min: NEGATIVE_INFINITY,
            max,
        }
    }

    /// Range open towards the future.
    pub fn at_least(min: EpochDay) -> Self {
        Self {
            min,
            max: POSITIVE_INFINITY,
        }
    }

    /// The all-covering range.
    pub fn all() -> Self {
        Self {
            min: NEGATIVE_INFINITY,
            max: POSITIVE_INFINITY,
        }
    }

    /// Lower bound (may be [`NEGATIVE_INFINITY`]).
    pub fn min(&self) -> EpochDay {
        self.min
    }

    /// Upper bound (may be [`POSITIVE_INFINITY`]).
    pub fn max(&self) -> EpochDay {
        self.max
    }

    /// Whether the lower bound is open.
    pub fn has_open_min(&self) -> bool {
        self.min == NEGATIVE_INFINITY
    }

    /// Whether the upper bound is open.
    pub fn has_open_max(&self) -> bool {
        self.max == POSITIVE_INFINITY
    }

    /// Whether `day` falls inside the range.
    pub fn contains(&self, day: EpochDay) -> bool {
        day >= self.min && day <= self.max
    }

    /// Whether the two ranges share at least one day.
    pub fn intersects(&self, other: &DateRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Intersection of both ranges, if any.
    pub fn intersection(&self, other: &DateRange) -> Option<DateRange> {
        if !self.intersects(other) {
            return None;
        }
        Some(DateRange {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        })
    }

    /// Number of covered days, `None` for open ranges.
    pub fn duration_days(&self) -> Option<i64> {
        if self.has_open_min() || self.has_open_max() {
            return None;
        }
        Some(i64::from(self.max) - i64::from(self.min) + 1)
    }

    /// Quarter index (year * 4 + quarter) of a day, used by the
    /// quarter-counting aggregator.
    pub fn quarter_of(day: EpochDay) -> i32 {
        let date = epoch_day_to_date(day);
        use chrono::Datelike;
        date.year() * 4 + (date.month0() / 3) as i32
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.has_open_min(), self.has_open_max()) {
            (true, true) => write!(f, "(-inf/+inf)"),
            (true, false) => write!(f, "(-inf/{})", format_day(self.max)),
            (false, true) => write!(f, "({}/+inf)", format_day(self.min)),
            (false, false) => write!(f, "({}/{})", format_day(self.min), format_day(self.max)),
        }
    }
}

fn epoch_day_to_date(day: EpochDay) -> NaiveDate {
    NaiveDate::from_num_days_from_ce_opt(day.saturating_add(719_163)).unwrap_or(NaiveDate::MIN)
}

fn format_day(day: EpochDay) -> String {
    epoch_day_to_date(day).format("%Y-%m-%d").to_string()
}
