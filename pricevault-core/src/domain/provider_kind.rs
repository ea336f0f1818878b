use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{DomainError, Period};

/// External data source. Adding a provider means adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Barchart,
    Yahoo,
    Gateway,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Barchart,
        ProviderKind::Yahoo,
        ProviderKind::Gateway,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Barchart => "barchart",
            ProviderKind::Yahoo => "yahoo",
            ProviderKind::Gateway => "gateway",
        }
    }

    /// Largest date span one request may cover for this period.
    ///
    /// Derived from each source's per-request record cap or duration limit.
    /// Every provider serves every period.
    pub fn max_span_days(&self, period: Period) -> u32 {
        match (self, period) {
            (ProviderKind::Barchart, Period::Minute1) => 10,
            (ProviderKind::Barchart, Period::Minute5) => 45,
            (ProviderKind::Barchart, Period::Minute15) => 120,
            (ProviderKind::Barchart, Period::Minute30) => 240,
            (ProviderKind::Barchart, Period::Hour1) => 480,
            (ProviderKind::Barchart, Period::Daily) => 7300,
            (ProviderKind::Barchart, Period::Weekly | Period::Monthly) => 36500,

            (ProviderKind::Yahoo, Period::Minute1) => 7,
            (ProviderKind::Yahoo, Period::Minute5 | Period::Minute15 | Period::Minute30) => 59,
            (ProviderKind::Yahoo, Period::Hour1) => 729,
            (ProviderKind::Yahoo, Period::Daily) => 3650,
            (ProviderKind::Yahoo, Period::Weekly | Period::Monthly) => 10950,

            (ProviderKind::Gateway, Period::Minute1) => 7,
            (ProviderKind::Gateway, Period::Minute5 | Period::Minute15 | Period::Minute30) => 30,
            (ProviderKind::Gateway, Period::Hour1) => 30,
            (ProviderKind::Gateway, Period::Daily) => 365,
            (ProviderKind::Gateway, Period::Weekly | Period::Monthly) => 3650,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "barchart" => Ok(ProviderKind::Barchart),
            "yahoo" | "yahoo_finance" => Ok(ProviderKind::Yahoo),
            "gateway" | "ib" | "ibkr" => Ok(ProviderKind::Gateway),
            _ => Err(DomainError::UnknownProvider(s.to_string())),
        }
    }
}
