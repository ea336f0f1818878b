use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::DomainError;

/// Sampling period of a price series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "1wk")]
    Weekly,
    #[serde(rename = "1mo")]
    Monthly,
}

impl Period {
    pub const ALL: [Period; 8] = [
        Period::Minute1,
        Period::Minute5,
        Period::Minute15,
        Period::Minute30,
        Period::Hour1,
        Period::Daily,
        Period::Weekly,
        Period::Monthly,
    ];

    /// Short code used in configuration and on-disk layout.
    pub fn code(&self) -> &'static str {
        match self {
            Period::Minute1 => "1m",
            Period::Minute5 => "5m",
            Period::Minute15 => "15m",
            Period::Minute30 => "30m",
            Period::Hour1 => "1h",
            Period::Daily => "1d",
            Period::Weekly => "1wk",
            Period::Monthly => "1mo",
        }
    }

    /// True for bars shorter than one trading day.
    pub fn is_intraday(&self) -> bool {
        matches!(
            self,
            Period::Minute1 | Period::Minute5 | Period::Minute15 | Period::Minute30 | Period::Hour1
        )
    }

    /// Canonical period list for an instrument.
    ///
    /// A missing or empty list means "no period specified", which always
    /// resolves to daily bars. Duplicates are removed and order is normalized.
    pub fn normalize_list(periods: Option<&[Period]>) -> Vec<Period> {
        let mut out: Vec<Period> = periods.map(|p| p.to_vec()).unwrap_or_default();
        if out.is_empty() {
            return vec![Period::Daily];
        }
        out.sort();
        out.dedup();
        out
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Period {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let period = match trimmed.as_str() {
            "1m" | "1min" => Period::Minute1,
            "5m" | "5min" => Period::Minute5,
            "15m" | "15min" => Period::Minute15,
            "30m" | "30min" => Period::Minute30,
            "1h" | "60m" | "hourly" => Period::Hour1,
            "1d" | "d" | "daily" => Period::Daily,
            "1wk" | "1w" | "weekly" => Period::Weekly,
            "1mo" | "monthly" => Period::Monthly,
            _ => return Err(DomainError::UnknownPeriod(s.to_string())),
        };
        Ok(period)
    }
}
