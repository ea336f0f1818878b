//! Canonical OHLCV record and its business rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ProviderKind;

/// One standardized OHLCV data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub provider: ProviderKind,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// When the provider returned this row; used to break dedup ties.
    pub fetched_at: DateTime<Utc>,
    /// Provider-specific columns (adjusted close, open interest, ...), keyed by canonical name.
    #[serde(default)]
    pub extras: BTreeMap<String, f64>,
}

impl CanonicalRecord {
    /// Dedup key within a dataset.
    pub fn key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.symbol.as_str())
    }

    /// Re-check the OHLC rules on an already-built record.
    pub fn check(&self) -> Result<(), BarViolation> {
        check_bar(self.open, self.high, self.low, self.close, self.volume as i64)
    }
}

/// Why a bar failed the business rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarViolation {
    /// `high < max(open, close)`
    HighBelowBody,
    /// `low > min(open, close)`
    LowAboveBody,
    NegativeVolume,
    NonFinitePrice,
}

impl fmt::Display for BarViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BarViolation::HighBelowBody => "high below max(open, close)",
            BarViolation::LowAboveBody => "low above min(open, close)",
            BarViolation::NegativeVolume => "negative volume",
            BarViolation::NonFinitePrice => "non-finite price",
        };
        f.write_str(s)
    }
}

/// OHLC relationship and volume sign check.
pub fn check_bar(open: f64, high: f64, low: f64, close: f64, volume: i64) -> Result<(), BarViolation> {
    if ![open, high, low, close].iter().all(|p| p.is_finite()) {
        return Err(BarViolation::NonFinitePrice);
    }
    if high < open.max(close) {
        return Err(BarViolation::HighBelowBody);
    }
    if low > open.min(close) {
        return Err(BarViolation::LowAboveBody);
    }
    if volume < 0 {
        return Err(BarViolation::NegativeVolume);
    }
    Ok(())
}
