//! Backup format: the same rows as the Parquet file, as plain CSV.
//!
//! Timestamps are RFC 3339 with millisecond precision. Floats use Rust's
//! shortest round-trip formatting so a backup restores bit-identical prices.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::parquet::extra_names;
use super::{StorageError, EXTRA_PREFIX};
use crate::domain::CanonicalRecord;

const HEADER: [&str; 9] = [
    "timestamp",
    "symbol",
    "provider",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "fetched_at",
];

fn csv_err(path: &Path, e: csv::Error) -> StorageError {
    StorageError::Csv(format!("{}: {e}", path.display()))
}

fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn write(records: &[CanonicalRecord], path: &Path) -> Result<(), StorageError> {
    let file = fs::File::create(path).map_err(|e| StorageError::io("create", path, e))?;
    let mut writer = csv::Writer::from_writer(file);

    let extras: Vec<String> = extra_names(records).into_iter().collect();
    let mut header: Vec<String> = HEADER.iter().map(|s| s.to_string()).collect();
    header.extend(extras.iter().map(|name| format!("{EXTRA_PREFIX}{name}")));
    writer.write_record(&header).map_err(|e| csv_err(path, e))?;

    for r in records {
        let mut row = vec![
            rfc3339(&r.timestamp),
            r.symbol.clone(),
            r.provider.name().to_string(),
            r.open.to_string(),
            r.high.to_string(),
            r.low.to_string(),
            r.close.to_string(),
            r.volume.to_string(),
            rfc3339(&r.fetched_at),
        ];
        for name in &extras {
            row.push(r.extras.get(name).map(f64::to_string).unwrap_or_default());
        }
        writer.write_record(&row).map_err(|e| csv_err(path, e))?;
    }

    writer
        .flush()
        .map_err(|e| StorageError::io("flush", path, e))?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Vec<CanonicalRecord>, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file = fs::File::open(path).map_err(|e| StorageError::io("open", path, e))?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader.headers().map_err(|e| csv_err(path, e))?.clone();

    let mut index = [0usize; 9];
    for (slot, name) in index.iter_mut().zip(HEADER) {
        *slot = headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| corrupt(format!("missing column '{name}'")))?;
    }
    let extra_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| h.strip_prefix(EXTRA_PREFIX).map(|n| (i, n.to_string())))
        .collect();

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| csv_err(path, e))?;
        let field = |i: usize| row.get(index[i]).unwrap_or("");
        let bad = |what: &str| corrupt(format!("row {}: bad {what}", line + 1));

        let time = |i: usize, what: &str| {
            DateTime::parse_from_rfc3339(field(i))
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| bad(what))
        };
        let float = |i: usize, what: &str| field(i).parse::<f64>().map_err(|_| bad(what));

        let mut extras = BTreeMap::new();
        for (i, name) in &extra_cols {
            let raw = row.get(*i).unwrap_or("");
            if raw.is_empty() {
                continue;
            }
            let v = raw.parse::<f64>().map_err(|_| bad(name.as_str()))?;
            extras.insert(name.clone(), v);
        }

        records.push(CanonicalRecord {
            timestamp: time(0, "timestamp")?,
            symbol: field(1).to_string(),
            provider: field(2).parse().map_err(|_| bad("provider"))?,
            open: float(3, "open")?,
            high: float(4, "high")?,
            low: float(5, "low")?,
            close: float(6, "close")?,
            volume: field(7).parse().map_err(|_| bad("volume"))?,
            fetched_at: time(8, "fetched_at")?,
            extras,
        });
    }
    Ok(records)
}
