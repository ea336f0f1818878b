//! Per-dataset metadata sidecar (`{symbol}.meta.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::StorageError;
use crate::domain::{CanonicalRecord, Coverage, Period, ProviderKind};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub symbol: String,
    pub instrument_type: String,
    pub period: Period,
    pub row_count: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Date ranges that have been fetched successfully, even where the provider had no bars.
    #[serde(default)]
    pub coverage: Coverage,
    pub last_updated: DateTime<Utc>,
    /// Quality score of the most recent batch that reported one.
    pub quality_score: Option<f64>,
    /// BLAKE3 over the serialized records.
    pub data_hash: String,
    #[serde(default)]
    pub providers: BTreeMap<ProviderKind, usize>,
    pub schema_version: u32,
}

pub fn data_hash(records: &[CanonicalRecord]) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(records).map_err(|e| StorageError::Metadata(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

pub fn provider_counts(records: &[CanonicalRecord]) -> BTreeMap<ProviderKind, usize> {
    let mut counts = BTreeMap::new();
    for r in records {
        *counts.entry(r.provider).or_insert(0) += 1;
    }
    counts
}

pub fn read(path: &Path) -> Result<Option<DatasetMeta>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| StorageError::io("read", path, e))?;
    let meta = serde_json::from_str(&content)
        .map_err(|e| StorageError::Metadata(format!("{}: {e}", path.display())))?;
    Ok(Some(meta))
}

/// Write via a temp file and rename.
pub fn write(meta: &DatasetMeta, path: &Path) -> Result<(), StorageError> {
    let json =
        serde_json::to_string_pretty(meta).map_err(|e| StorageError::Metadata(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| StorageError::io("write", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StorageError::io("rename", path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use crate::domain::DateRange;

    #[test]
    fn meta_file_round_trips_with_provider_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GC.meta.json");
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        let mut providers = BTreeMap::new();
        providers.insert(ProviderKind::Barchart, 3);
        providers.insert(ProviderKind::Yahoo, 4);
        let meta = DatasetMeta {
            symbol: "GC".into(),
            instrument_type: "futures".into(),
            period: Period::Daily,
            row_count: 7,
            first_timestamp: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
            last_timestamp: Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()),
            coverage: Coverage::from_ranges([DateRange::new(d(1, 1), d(1, 11)).unwrap()]),
            last_updated: Utc.with_ymd_and_hms(2024, 1, 11, 8, 0, 0).unwrap(),
            quality_score: Some(1.0),
            data_hash: "abc".into(),
            providers,
            schema_version: SCHEMA_VERSION,
        };
        write(&meta, &path).unwrap();
        assert_eq!(read(&path).unwrap(), Some(meta));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_meta_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read(&dir.path().join("nope.meta.json")).unwrap(), None);
    }

    #[test]
    fn empty_dataset_hash_is_stable() {
        let hash = data_hash(&[]).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, data_hash(&[]).unwrap());
    }
}
