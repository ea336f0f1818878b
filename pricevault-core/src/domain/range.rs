//! Half-open calendar date ranges and coverage sets.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::DomainError;

/// Half-open interval `[start, end)` of calendar dates. `start < end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRange", into = "RawRange")]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Serialize, Deserialize)]
struct RawRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawRange> for DateRange {
    type Error = DomainError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        DateRange::new(raw.start, raw.end)
    }
}

impl From<DateRange> for RawRange {
    fn from(range: DateRange) -> Self {
        RawRange {
            start: range.start,
            end: range.end,
        }
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DomainError> {
        if start >= end {
            return Err(DomainError::EmptyRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Exclusive end date.
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Last date inside the range.
    pub fn last_day(&self) -> NaiveDate {
        self.end - Duration::days(1)
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// True if `other` lies entirely inside this range.
    pub fn encloses(&self, other: &DateRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Overlapping part of two ranges, if any.
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        DateRange::new(start, end).ok()
    }

    /// Range with its start moved forward to `date` (no-op if already later).
    pub fn clamp_start(&self, date: NaiveDate) -> Option<DateRange> {
        DateRange::new(self.start.max(date), self.end).ok()
    }

    /// Range with its end pulled back to `date` (no-op if already earlier).
    pub fn clamp_end(&self, date: NaiveDate) -> Option<DateRange> {
        DateRange::new(self.start, self.end.min(date)).ok()
    }

    /// Split into consecutive chunks of at most `max_days` days.
    ///
    /// Chunks are contiguous, non-overlapping and their union is exactly `self`.
    pub fn chunks(&self, max_days: u32) -> Vec<DateRange> {
        let step = Duration::days(i64::from(max_days.max(1)));
        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = (cursor + step).min(self.end);
            out.push(DateRange {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        out
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Normalized union of date ranges: sorted, non-overlapping, non-adjacent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coverage(Vec<DateRange>);

impl Coverage {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = DateRange>) -> Self {
        let mut coverage = Self::new();
        for r in ranges {
            coverage.insert(r);
        }
        coverage
    }

    pub fn ranges(&self) -> &[DateRange] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add a range, merging with any overlapping or touching neighbours.
    pub fn insert(&mut self, range: DateRange) {
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.0.len() + 1);
        for existing in self.0.drain(..) {
            if existing.end < merged.start || merged.end < existing.start {
                kept.push(existing);
            } else {
                merged = DateRange {
                    start: existing.start.min(merged.start),
                    end: existing.end.max(merged.end),
                };
            }
        }
        kept.push(merged);
        kept.sort();
        self.0 = kept;
    }

    /// True if `range` lies entirely inside one covered interval.
    pub fn covers(&self, range: &DateRange) -> bool {
        self.0.iter().any(|c| c.encloses(range))
    }

    pub fn total_days(&self) -> i64 {
        self.0.iter().map(DateRange::num_days).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn rejects_empty_and_inverted_ranges() {
        assert!(DateRange::new(d(2024, 1, 2), d(2024, 1, 2)).is_err());
        assert!(DateRange::new(d(2024, 1, 3), d(2024, 1, 2)).is_err());
        assert!(DateRange::new(d(2024, 1, 2), d(2024, 1, 3)).is_ok());
    }

    #[test]
    fn chunks_cover_range_exactly() {
        let range = DateRange::new(d(2024, 1, 1), d(2024, 1, 11)).unwrap();
        let chunks = range.chunks(4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], DateRange::new(d(2024, 1, 1), d(2024, 1, 5)).unwrap());
        assert_eq!(chunks[2], DateRange::new(d(2024, 1, 9), d(2024, 1, 11)).unwrap());
    }

    #[test]
    fn half_open_contains() {
        let range = DateRange::new(d(2024, 1, 1), d(2024, 1, 3)).unwrap();
        assert!(range.contains(d(2024, 1, 1)));
        assert!(range.contains(d(2024, 1, 2)));
        assert!(!range.contains(d(2024, 1, 3)));
        assert_eq!(range.last_day(), d(2024, 1, 2));
    }

    #[test]
    fn deserialize_rejects_inverted_range() {
        let bad = r#"{"start":"2024-02-01","end":"2024-01-01"}"#;
        assert!(serde_json::from_str::<DateRange>(bad).is_err());
    }

    #[test]
    fn coverage_merges_touching_ranges() {
        let mut cov = Coverage::new();
        cov.insert(DateRange::new(d(2024, 1, 1), d(2024, 1, 5)).unwrap());
        cov.insert(DateRange::new(d(2024, 1, 10), d(2024, 1, 12)).unwrap());
        cov.insert(DateRange::new(d(2024, 1, 5), d(2024, 1, 10)).unwrap());
        assert_eq!(cov.ranges().len(), 1);
        assert!(cov.covers(&DateRange::new(d(2024, 1, 2), d(2024, 1, 12)).unwrap()));
        assert!(!cov.covers(&DateRange::new(d(2023, 12, 31), d(2024, 1, 2)).unwrap()));
    }

    #[test]
    fn coverage_keeps_gaps() {
        let cov = Coverage::from_ranges([
            DateRange::new(d(2024, 1, 1), d(2024, 1, 5)).unwrap(),
            DateRange::new(d(2024, 1, 7), d(2024, 1, 9)).unwrap(),
        ]);
        assert_eq!(cov.ranges().len(), 2);
        assert_eq!(cov.total_days(), 6);
        assert!(!cov.covers(&DateRange::new(d(2024, 1, 4), d(2024, 1, 8)).unwrap()));
    }
}
