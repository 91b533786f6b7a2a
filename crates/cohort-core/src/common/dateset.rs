//! Ordered set of non-overlapping date ranges.

use super::daterange::DateRange;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of days represented as sorted, coalesced [`DateRange`]s.
///
/// Ranges that touch (gap of one day) are merged on insertion, so the
/// internal vector is always minimal and ordered by `min`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSet {
    ranges: Vec<DateRange>,
}

impl DateSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set containing exactly `range`.
    pub fn from_range(range: DateRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    /// The all-covering set.
    pub fn all() -> Self {
        Self::from_range(DateRange::all())
    }

    /// Whether no day is covered.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The covered ranges in ascending order.
    pub fn ranges(&self) -> &[DateRange] {
        &self.ranges
    }

    /// Hull from the first covered day to the last, `None` when empty.
    pub fn span(&self) -> Option<DateRange> {
        match (self.ranges.first(), self.ranges.last()) {
            (Some(first), Some(last)) => Some(DateRange::of(first.min(), last.max())),
            _ => None,
        }
    }

    /// Total number of covered days, `None` when any range is open.
    pub fn count_days(&self) -> Option<i64> {
        self.ranges
            .iter()
            .map(DateRange::duration_days)
            .try_fold(0i64, |acc, days| days.map(|d| acc + d))
    }

    /// Add a range, merging with existing overlapping or adjacent ranges.
    pub fn add(&mut self, range: DateRange) {
        let mut min = range.min();
        let mut max = range.max();

        // Collect every existing range that overlaps or touches the new one.
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        for existing in &self.ranges {
            let touches = existing.min().saturating_sub(1) <= max
                && min.saturating_sub(1) <= existing.max();
            if touches {
                min = min.min(existing.min());
                max = max.max(existing.max());
            } else {
                merged.push(*existing);
            }
        }
        merged.push(DateRange::of(min, max));
        merged.sort_by_key(DateRange::min);
        self.ranges = merged;
    }

    /// Union with another set.
    pub fn add_all(&mut self, other: &DateSet) {
        for range in &other.ranges {
            self.add(*range);
        }
    }

    /// Keep only days also covered by `other`.
    pub fn retain_all(&mut self, other: &DateSet) {
        let mut result = Vec::new();
        for range in &self.ranges {
            for keep in &other.ranges {
                if let Some(common) = range.intersection(keep) {
                    result.push(common);
                }
            }
        }
        result.sort_by_key(DateRange::min);
        self.ranges = result;
    }

    /// Whether the set covers every representable day, i.e. restricts
    /// nothing.
    pub fn covers_all(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == DateRange::all()
    }

    /// Whether `day` is covered.
    pub fn contains(&self, day: i32) -> bool {
        self.ranges.iter().any(|r| r.contains(day))
    }

    /// Whether any covered day lies inside `range`.
    pub fn intersects(&self, range: &DateRange) -> bool {
        self.ranges.iter().any(|r| r.intersects(range))
    }
}

impl fmt::Display for DateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{range}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<DateRange> for DateSet {
    fn from_iter<T: IntoIterator<Item = DateRange>>(iter: T) -> Self {
        let mut set = DateSet::new();
        for range in iter {
            set.add(range);
        }
        set
    }
}
