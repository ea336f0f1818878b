//! Primary format: one Parquet file per dataset.

use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use super::{StorageError, EXTRA_PREFIX};
use crate::domain::{CanonicalRecord, ProviderKind};

const REQUIRED: [&str; 9] = [
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

fn ms_datetime() -> DataType {
    DataType::Datetime(TimeUnit::Milliseconds, None)
}

/// Convert records to a Polars DataFrame. Extras become nullable `x_*` columns.
pub fn records_to_dataframe(records: &[CanonicalRecord]) -> Result<DataFrame, StorageError> {
    let perr = |what: &str, e: PolarsError| StorageError::Parquet(format!("{what}: {e}"));

    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_millis()).collect();
    let symbols: Vec<&str> = records.iter().map(|r| r.symbol.as_str()).collect();
    let providers: Vec<&str> = records.iter().map(|r| r.provider.name()).collect();
    let opens: Vec<f64> = records.iter().map(|r| r.open).collect();
    let highs: Vec<f64> = records.iter().map(|r| r.high).collect();
    let lows: Vec<f64> = records.iter().map(|r| r.low).collect();
    let closes: Vec<f64> = records.iter().map(|r| r.close).collect();
    let volumes: Vec<u64> = records.iter().map(|r| r.volume).collect();
    let fetched: Vec<i64> = records.iter().map(|r| r.fetched_at.timestamp_millis()).collect();

    let mut columns = vec![
        Column::new("timestamp".into(), timestamps)
            .cast(&ms_datetime())
            .map_err(|e| perr("timestamp cast", e))?,
        Column::new("symbol".into(), symbols),
        Column::new("provider".into(), providers),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("fetched_at".into(), fetched)
            .cast(&ms_datetime())
            .map_err(|e| perr("fetched_at cast", e))?,
    ];

    for name in extra_names(records) {
        let values: Vec<Option<f64>> = records.iter().map(|r| r.extras.get(&name).copied()).collect();
        columns.push(Column::new(format!("{EXTRA_PREFIX}{name}").into(), values));
    }

    DataFrame::new(columns).map_err(|e| perr("dataframe creation", e))
}

pub(crate) fn extra_names(records: &[CanonicalRecord]) -> BTreeSet<String> {
    records
        .iter()
        .flat_map(|r| r.extras.keys().cloned())
        .collect()
}

pub fn write(records: &[CanonicalRecord], path: &Path) -> Result<(), StorageError> {
    let mut df = records_to_dataframe(records)?;
    let file = fs::File::create(path).map_err(|e| StorageError::io("create", path, e))?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| StorageError::Parquet(format!("write {}: {e}", path.display())))?;
    Ok(())
}

/// Load a Parquet file and validate its schema.
pub fn read(path: &Path) -> Result<Vec<CanonicalRecord>, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file = fs::File::open(path).map_err(|e| StorageError::io("open", path, e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| corrupt(format!("read: {e}")))?;

    for name in REQUIRED {
        if df.column(name).is_err() {
            return Err(corrupt(format!("missing column '{name}'")));
        }
    }

    dataframe_to_records(&df).map_err(|e| corrupt(e.to_string()))
}

/// Convert a DataFrame back to records.
pub fn dataframe_to_records(df: &DataFrame) -> PolarsResult<Vec<CanonicalRecord>> {
    let timestamps = df.column("timestamp")?.cast(&DataType::Int64)?;
    let fetched = df.column("fetched_at")?.cast(&DataType::Int64)?;
    let ts_ca = timestamps.i64()?;
    let fetched_ca = fetched.i64()?;
    let symbol_ca = df.column("symbol")?.str()?;
    let provider_ca = df.column("provider")?.str()?;
    let open_ca = df.column("open")?.f64()?;
    let high_ca = df.column("high")?.f64()?;
    let low_ca = df.column("low")?.f64()?;
    let close_ca = df.column("close")?.f64()?;
    let vol_ca = df.column("volume")?.u64()?;

    let mut extra_cols = Vec::new();
    for col in df.get_columns() {
        if let Some(name) = col.name().as_str().strip_prefix(EXTRA_PREFIX) {
            extra_cols.push((name.to_string(), col.f64()?));
        }
    }

    let missing = |what: &str, i: usize| polars_err!(ComputeError: "null {} at row {}", what, i);

    let n = df.height();
    let mut records = Vec::with_capacity(n);
    for i in 0..n {
        let ts = ts_ca.get(i).ok_or_else(|| missing("timestamp", i))?;
        let fetched_at = fetched_ca.get(i).ok_or_else(|| missing("fetched_at", i))?;
        let provider_name = provider_ca.get(i).ok_or_else(|| missing("provider", i))?;
        let provider: ProviderKind = provider_name
            .parse()
            .map_err(|e| polars_err!(ComputeError: "row {}: {}", i, e))?;

        let mut extras = BTreeMap::new();
        for (name, ca) in &extra_cols {
            if let Some(v) = ca.get(i) {
                extras.insert(name.clone(), v);
            }
        }

        records.push(CanonicalRecord {
            timestamp: millis(ts).ok_or_else(|| missing("timestamp", i))?,
            symbol: symbol_ca
                .get(i)
                .ok_or_else(|| missing("symbol", i))?
                .to_string(),
            provider,
            open: open_ca.get(i).ok_or_else(|| missing("open", i))?,
            high: high_ca.get(i).ok_or_else(|| missing("high", i))?,
            low: low_ca.get(i).ok_or_else(|| missing("low", i))?,
            close: close_ca.get(i).ok_or_else(|| missing("close", i))?,
            volume: vol_ca.get(i).ok_or_else(|| missing("volume", i))?,
            fetched_at: millis(fetched_at).ok_or_else(|| missing("fetched_at", i))?,
            extras,
        });
    }
    Ok(records)
}

fn millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(day: u32, extra: Option<f64>) -> CanonicalRecord {
        let mut extras = BTreeMap::new();
        if let Some(v) = extra {
            extras.insert("open_interest".to_string(), v);
        }
        CanonicalRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            symbol: "GC".into(),
            provider: ProviderKind::Barchart,
            open: 2050.5,
            high: 2061.25,
            low: 2040.0,
            close: 2055.1,
            volume: 123_456,
            fetched_at: Utc.timestamp_millis_opt(1_706_000_000_123).unwrap(),
            extras,
        }
    }

    #[test]
    fn records_survive_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GC.parquet");
        let records = vec![record(2, Some(480_000.0)), record(3, None)];
        write(&records, &path).unwrap();
        assert_eq!(read(&path).unwrap(), records);
    }

    #[test]
    fn null_price_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GC.parquet");
        let mut df = records_to_dataframe(&[record(2, None), record(3, None)]).unwrap();
        df.with_column(Column::new("close".into(), vec![Some(2055.1), None]))
            .unwrap();
        ParquetWriter::new(fs::File::create(&path).unwrap())
            .finish(&mut df)
            .unwrap();

        match read(&path) {
            Err(StorageError::Corrupt { reason, .. }) => assert!(reason.contains("close"), "{reason}"),
            other => panic!("expected corrupt file, got {other:?}"),
        }
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GC.parquet");
        fs::write(&path, b"definitely not parquet").unwrap();
        assert!(matches!(read(&path), Err(StorageError::Corrupt { .. })));
    }
}
