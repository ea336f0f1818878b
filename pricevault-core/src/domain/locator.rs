//! Dataset locator: where one instrument+period lives on disk.
//!
//! Layout: `{output_root}/{instrument_type}/{period}/{symbol}.{ext}` with
//! `parquet` (primary), `csv` (backup) and `meta.json` (metadata) siblings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::{Instrument, Period};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetLocator {
    root: PathBuf,
    instrument_type: String,
    period: Period,
    symbol: String,
}

impl DatasetLocator {
    pub fn new(root: impl Into<PathBuf>, instrument: &Instrument, period: Period) -> Self {
        Self {
            root: root.into(),
            instrument_type: instrument.class().dir_name().to_string(),
            period,
            symbol: instrument.symbol().to_string(),
        }
    }

    /// Rebuild a locator from its parts (used when scanning an output root).
    pub fn from_parts(
        root: impl Into<PathBuf>,
        instrument_type: &str,
        period: Period,
        symbol: &str,
    ) -> Self {
        Self {
            root: root.into(),
            instrument_type: instrument_type.to_string(),
            period,
            symbol: symbol.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instrument_type(&self) -> &str {
        &self.instrument_type
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// `{root}/{instrument_type}/{period}/`
    pub fn dir(&self) -> PathBuf {
        self.root
            .join(&self.instrument_type)
            .join(self.period.code())
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir().join(format!("{}.parquet", self.symbol))
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir().join(format!("{}.csv", self.symbol))
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir().join(format!("{}.meta.json", self.symbol))
    }
}

impl fmt::Display for DatasetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instrument_type, self.period, self.symbol
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn paths_follow_layout() {
        let gc = Instrument::future("GC", None, NaiveDate::from_ymd_opt(1975, 1, 2).unwrap(), None)
            .unwrap();
        let loc = DatasetLocator::new("/data", &gc, Period::Daily);
        assert_eq!(loc.primary_path(), PathBuf::from("/data/futures/1d/GC.parquet"));
        assert_eq!(loc.backup_path(), PathBuf::from("/data/futures/1d/GC.csv"));
        assert_eq!(loc.meta_path(), PathBuf::from("/data/futures/1d/GC.meta.json"));
        assert_eq!(loc.to_string(), "futures/1d/GC");
    }
}
