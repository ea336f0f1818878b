//! Typed coercion of raw cells.
//!
//! Every function returns `None` when the cell cannot be represented; the
//! caller decides whether that drops the row.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use super::mapping::TimeFormat;
use crate::provider::RawCell;

pub fn price(cell: &RawCell) -> Option<f64> {
    let v = match cell {
        RawCell::Number(n) => *n,
        RawCell::Text(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        RawCell::Null => return None,
    };
    v.is_finite().then_some(v)
}

/// Signed so negative volumes reach the business rules instead of vanishing here.
/// A missing volume is zero (index and forex series carry none).
pub fn volume(cell: &RawCell) -> Option<i64> {
    match cell {
        RawCell::Null => Some(0),
        RawCell::Number(n) => float_to_int(*n),
        RawCell::Text(s) => {
            let s = s.trim().replace(',', "");
            if s.is_empty() {
                return Some(0);
            }
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(float_to_int))
        }
    }
}

/// Optional extra column; absent or unparseable values are omitted.
pub fn extra(cell: &RawCell) -> Option<f64> {
    price(cell)
}

pub fn timestamp(cell: &RawCell, formats: &[TimeFormat]) -> Option<DateTime<Utc>> {
    match cell {
        RawCell::Null => None,
        RawCell::Number(n) => formats
            .contains(&TimeFormat::EpochSeconds)
            .then(|| float_to_int(*n))
            .flatten()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        RawCell::Text(s) => {
            let s = s.trim();
            formats.iter().find_map(|f| parse_text(s, *f))
        }
    }
}

fn parse_text(s: &str, format: TimeFormat) -> Option<DateTime<Utc>> {
    match format {
        TimeFormat::EpochSeconds => {
            if !s.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
                return None;
            }
            DateTime::from_timestamp(s.parse::<i64>().ok()?, 0)
        }
        TimeFormat::Date(pattern) => {
            let date = NaiveDate::parse_from_str(s, pattern).ok()?;
            // Reject lenient matches (e.g. epoch digits read as a date).
            if date.format(pattern).to_string() != s {
                return None;
            }
            Some(date.and_time(NaiveTime::MIN).and_utc())
        }
        TimeFormat::DateTime(pattern) => NaiveDateTime::parse_from_str(s, pattern)
            .ok()
            .map(|dt| dt.and_utc()),
    }
}

fn float_to_int(v: f64) -> Option<i64> {
    if !v.is_finite() || v.abs() > i64::MAX as f64 {
        return None;
    }
    Some(v.round() as i64)
}
