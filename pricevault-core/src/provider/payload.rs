//! Raw provider output, before validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ProviderKind;

/// A single cell of a structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCell {
    Null,
    Number(f64),
    Text(String),
}

impl RawCell {
    pub fn is_null(&self) -> bool {
        match self {
            RawCell::Null => true,
            RawCell::Text(s) => s.trim().is_empty(),
            RawCell::Number(_) => false,
        }
    }
}

impl From<Option<f64>> for RawCell {
    fn from(v: Option<f64>) -> Self {
        v.map_or(RawCell::Null, RawCell::Number)
    }
}

/// Column-named rows, as decoded from a JSON or frame-based response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawCell>>,
}

impl RawTable {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn push(&mut self, row: Vec<RawCell>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayloadBody {
    /// Delimited text with a header line.
    Csv(Vec<u8>),
    Table(RawTable),
}

/// What a provider returned for one fetch, tagged with where and when it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub provider: ProviderKind,
    pub symbol: String,
    /// Truncated to milliseconds so it round-trips through storage exactly.
    pub fetched_at: DateTime<Utc>,
    pub body: PayloadBody,
}

impl RawPayload {
    pub fn new(provider: ProviderKind, symbol: &str, body: PayloadBody) -> Self {
        Self {
            provider,
            symbol: symbol.to_string(),
            fetched_at: now_millis(),
            body,
        }
    }

    pub fn with_fetched_at(mut self, at: DateTime<Utc>) -> Self {
        self.fetched_at = truncate_millis(at);
        self
    }
}

pub(crate) fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub(crate) fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}
