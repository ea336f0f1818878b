//! Validation and transformation of raw provider payloads.
//!
//! Steps, in order:
//! 1. Map provider column names to canonical fields; a missing required column fails the batch.
//! 2. Coerce prices to `f64`, volume to an integer; rows that fail are dropped.
//! 3. Business rules: OHLC relationship, non-negative volume, strictly
//!    increasing timestamps. Failing rows are dropped and counted per reason.
//! 4. Score the batch (`valid / total`) and reject it below the configured threshold.

pub mod coerce;
pub mod mapping;

pub use mapping::{FieldMap, TimeFormat};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::domain::{BarViolation, CanonicalRecord, ProviderKind};
use crate::provider::{PayloadBody, RawCell, RawPayload, RawTable};

/// Default minimum share of valid rows.
pub const DEFAULT_MIN_QUALITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityPolicy {
    pub min_quality: f64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            min_quality: DEFAULT_MIN_QUALITY,
        }
    }
}

/// Why a row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    BadTimestamp,
    BadPrice,
    BadVolume,
    HighBelowBody,
    LowAboveBody,
    NegativeVolume,
    NonFinitePrice,
    NonIncreasingTimestamp,
    DuplicateTimestamp,
}

impl From<BarViolation> for DropReason {
    fn from(v: BarViolation) -> Self {
        match v {
            BarViolation::HighBelowBody => DropReason::HighBelowBody,
            BarViolation::LowAboveBody => DropReason::LowAboveBody,
            BarViolation::NegativeVolume => DropReason::NegativeVolume,
            BarViolation::NonFinitePrice => DropReason::NonFinitePrice,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::BadTimestamp => "bad_timestamp",
            DropReason::BadPrice => "bad_price",
            DropReason::BadVolume => "bad_volume",
            DropReason::HighBelowBody => "high_below_body",
            DropReason::LowAboveBody => "low_above_body",
            DropReason::NegativeVolume => "negative_volume",
            DropReason::NonFinitePrice => "non_finite_price",
            DropReason::NonIncreasingTimestamp => "non_increasing_timestamp",
            DropReason::DuplicateTimestamp => "duplicate_timestamp",
        };
        f.write_str(s)
    }
}

/// Row accounting for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub dropped: BTreeMap<DropReason, usize>,
    pub quality_score: f64,
}

impl QualityReport {
    fn new(total_rows: usize, valid_rows: usize, dropped: BTreeMap<DropReason, usize>) -> Self {
        let quality_score = if total_rows == 0 {
            1.0
        } else {
            valid_rows as f64 / total_rows as f64
        };
        Self {
            total_rows,
            valid_rows,
            dropped,
            quality_score,
        }
    }

    pub fn dropped_rows(&self) -> usize {
        self.dropped.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("{provider} payload is missing required column '{column}'")]
    MissingColumn {
        provider: ProviderKind,
        column: String,
    },

    #[error("unreadable payload: {0}")]
    Unreadable(String),

    #[error("quality {:.3} below threshold {threshold:.3} ({} of {} rows valid)", .report.quality_score, .report.valid_rows, .report.total_rows)]
    QualityBelowThreshold { threshold: f64, report: QualityReport },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub records: Vec<CanonicalRecord>,
    pub report: QualityReport,
}

struct Columns {
    timestamp: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
    extras: Vec<(usize, &'static str)>,
}

impl Columns {
    fn resolve(table: &RawTable, map: &FieldMap) -> Result<Self, SchemaError> {
        let required = |name: &str| {
            table
                .column_index(name)
                .ok_or_else(|| SchemaError::MissingColumn {
                    provider: map.provider,
                    column: name.to_string(),
                })
        };
        let timestamp = map
            .timestamp
            .iter()
            .find_map(|c| table.column_index(c))
            .ok_or_else(|| SchemaError::MissingColumn {
                provider: map.provider,
                column: map.timestamp.join("|"),
            })?;
        Ok(Self {
            timestamp,
            open: required(map.open)?,
            high: required(map.high)?,
            low: required(map.low)?,
            close: required(map.close)?,
            volume: required(map.volume)?,
            extras: map
                .extras
                .iter()
                .filter_map(|(col, canonical)| table.column_index(col).map(|i| (i, *canonical)))
                .collect(),
        })
    }
}

/// Normalize a raw payload into canonical records.
pub fn transform(
    payload: &RawPayload,
    map: &FieldMap,
    policy: &QualityPolicy,
) -> Result<TransformOutput, SchemaError> {
    let table: Cow<'_, RawTable> = match &payload.body {
        PayloadBody::Csv(bytes) => Cow::Owned(parse_csv(bytes)?),
        PayloadBody::Table(table) => Cow::Borrowed(table),
    };

    if table.is_empty() {
        return Ok(TransformOutput {
            records: Vec::new(),
            report: QualityReport::new(0, 0, BTreeMap::new()),
        });
    }

    let cols = Columns::resolve(&table, map)?;
    let null = RawCell::Null;
    let mut records: Vec<CanonicalRecord> = Vec::with_capacity(table.len());
    let mut dropped: BTreeMap<DropReason, usize> = BTreeMap::new();

    for row in &table.rows {
        let cell = |i: usize| row.get(i).unwrap_or(&null);
        match build_record(payload, map, &cols, cell, records.last()) {
            Ok(record) => records.push(record),
            Err(reason) => *dropped.entry(reason).or_default() += 1,
        }
    }

    let report = QualityReport::new(table.len(), records.len(), dropped);
    if report.dropped_rows() > 0 {
        tracing::warn!(
            provider = %payload.provider,
            symbol = payload.symbol.as_str(),
            total = report.total_rows,
            valid = report.valid_rows,
            dropped = ?report.dropped,
            "rows dropped during validation"
        );
    } else {
        tracing::debug!(
            provider = %payload.provider,
            symbol = payload.symbol.as_str(),
            rows = report.valid_rows,
            "batch validated"
        );
    }

    if report.quality_score < policy.min_quality {
        return Err(SchemaError::QualityBelowThreshold {
            threshold: policy.min_quality,
            report,
        });
    }
    Ok(TransformOutput { records, report })
}

fn build_record<'a>(
    payload: &RawPayload,
    map: &FieldMap,
    cols: &Columns,
    cell: impl Fn(usize) -> &'a RawCell,
    previous: Option<&CanonicalRecord>,
) -> Result<CanonicalRecord, DropReason> {
    let timestamp =
        coerce::timestamp(cell(cols.timestamp), map.time_formats).ok_or(DropReason::BadTimestamp)?;
    let open = coerce::price(cell(cols.open)).ok_or(DropReason::BadPrice)?;
    let high = coerce::price(cell(cols.high)).ok_or(DropReason::BadPrice)?;
    let low = coerce::price(cell(cols.low)).ok_or(DropReason::BadPrice)?;
    let close = coerce::price(cell(cols.close)).ok_or(DropReason::BadPrice)?;
    let volume = coerce::volume(cell(cols.volume)).ok_or(DropReason::BadVolume)?;

    crate::domain::check_bar(open, high, low, close, volume)?;

    if let Some(prev) = previous {
        if timestamp == prev.timestamp {
            return Err(DropReason::DuplicateTimestamp);
        }
        if timestamp < prev.timestamp {
            return Err(DropReason::NonIncreasingTimestamp);
        }
    }

    let extras = cols
        .extras
        .iter()
        .filter_map(|(i, name)| coerce::extra(cell(*i)).map(|v| (name.to_string(), v)))
        .collect();

    Ok(CanonicalRecord {
        timestamp,
        symbol: payload.symbol.clone(),
        provider: payload.provider,
        open,
        high,
        low,
        close,
        // Non-negative after check_bar.
        volume: volume as u64,
        fetched_at: payload.fetched_at,
        extras,
    })
}

fn parse_csv(bytes: &[u8]) -> Result<RawTable, SchemaError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| SchemaError::Unreadable(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut table = RawTable {
        columns,
        rows: Vec::new(),
    };
    for record in reader.records() {
        let record = record.map_err(|e| SchemaError::Unreadable(e.to_string()))?;
        table.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        RawCell::Null
                    } else {
                        RawCell::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(table)
}
