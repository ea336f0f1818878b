use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{DomainError, Period};

/// Instrument class with class-specific attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstrumentClass {
    /// Futures root (e.g. `GC`), with an optional listed-month cycle such as `GJMQVZ`.
    Future { cycle: Option<String> },
    Stock,
    /// Currency pair; the symbol is always `{base}{quote}`.
    ForexPair { base: String, quote: String },
}

impl InstrumentClass {
    /// Directory name used in the dataset layout.
    pub fn dir_name(&self) -> &'static str {
        match self {
            InstrumentClass::Future { .. } => "futures",
            InstrumentClass::Stock => "stocks",
            InstrumentClass::ForexPair { .. } => "forex",
        }
    }
}

/// A tradable entity. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    symbol: String,
    class: InstrumentClass,
    first_date: NaiveDate,
    periods: Vec<Period>,
}

impl Instrument {
    pub fn future(
        symbol: &str,
        cycle: Option<&str>,
        first_date: NaiveDate,
        periods: Option<&[Period]>,
    ) -> Result<Self, DomainError> {
        let symbol = normalize_symbol(symbol)?;
        let cycle = match cycle.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => Some(validate_cycle(c)?),
            None => None,
        };
        Ok(Self {
            symbol,
            class: InstrumentClass::Future { cycle },
            first_date,
            periods: Period::normalize_list(periods),
        })
    }

    pub fn stock(
        symbol: &str,
        first_date: NaiveDate,
        periods: Option<&[Period]>,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            class: InstrumentClass::Stock,
            first_date,
            periods: Period::normalize_list(periods),
        })
    }

    /// Build a currency pair from any of the common spellings
    /// (`EURUSD`, `EUR/USD`, `EUR.USD`, `EUR_USD`, `EURUSD=X`, `^EURUSD`).
    pub fn forex(
        code: &str,
        first_date: NaiveDate,
        periods: Option<&[Period]>,
    ) -> Result<Self, DomainError> {
        let (base, quote) = parse_forex_code(code)?;
        Ok(Self {
            symbol: format!("{base}{quote}"),
            class: InstrumentClass::ForexPair { base, quote },
            first_date,
            periods: Period::normalize_list(periods),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn class(&self) -> &InstrumentClass {
        &self.class
    }

    pub fn first_date(&self) -> NaiveDate {
        self.first_date
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    pub fn supports(&self, period: Period) -> bool {
        self.periods.contains(&period)
    }

    pub fn contract_cycle(&self) -> Option<&str> {
        match &self.class {
            InstrumentClass::Future { cycle } => cycle.as_deref(),
            _ => None,
        }
    }

    /// Base and quote currency for forex pairs.
    pub fn currencies(&self) -> Option<(&str, &str)> {
        match &self.class {
            InstrumentClass::ForexPair { base, quote } => Some((base, quote)),
            _ => None,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class.dir_name(), self.symbol)
    }
}

fn normalize_symbol(symbol: &str) -> Result<String, DomainError> {
    let s = symbol.trim().to_ascii_uppercase();
    if s.is_empty() {
        return Err(DomainError::InvalidSymbol(symbol.to_string()));
    }
    // Symbols become file names in the dataset layout.
    if s.contains(['/', '\\']) || s.starts_with('.') {
        return Err(DomainError::InvalidSymbol(symbol.to_string()));
    }
    Ok(s)
}

const MONTH_CODES: &str = "FGHJKMNQUVXZ";

fn validate_cycle(cycle: &str) -> Result<String, DomainError> {
    let upper = cycle.to_ascii_uppercase();
    if upper.chars().all(|c| MONTH_CODES.contains(c)) {
        Ok(upper)
    } else {
        Err(DomainError::InvalidCycle(cycle.to_string()))
    }
}

/// Split a forex code into ISO-style base and quote currencies.
pub fn parse_forex_code(code: &str) -> Result<(String, String), DomainError> {
    let cleaned: String = code
        .trim()
        .trim_start_matches('^')
        .trim_end_matches("=X")
        .trim_end_matches("=x")
        .chars()
        .filter(|c| !matches!(c, '/' | '.' | '_' | '-' | ' '))
        .collect::<String>()
        .to_ascii_uppercase();

    if cleaned.len() != 6 || !cleaned.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DomainError::InvalidForexCode(code.to_string()));
    }
    let (base, quote) = cleaned.split_at(3);
    if base == quote {
        return Err(DomainError::InvalidForexCode(code.to_string()));
    }
    Ok((base.to_string(), quote.to_string()))
}
