//! Dual-format dataset storage.
//!
//! Each dataset lives under `{root}/{instrument_type}/{period}/` as
//! `{symbol}.parquet` (primary), `{symbol}.csv` (backup) and
//! `{symbol}.meta.json`. Writes go to `.tmp` files first and are committed
//! by rename only after both formats are written; a failed commit restores
//! the previous files. Nothing is cached in memory between calls.

pub mod csv_backup;
pub mod merge;
pub mod meta;
pub mod parquet;

pub use meta::{DatasetMeta, SCHEMA_VERSION};

use chrono::{NaiveDate, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{CanonicalRecord, DatasetLocator, DateRange, Period, ProviderKind};

/// Column prefix for provider-specific extras in both file formats.
pub const EXTRA_PREFIX: &str = "x_";

/// Merges that would leave fewer rows than this are rejected.
pub const DEFAULT_MIN_ROWS: usize = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("corrupt dataset file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("merge would leave {rows} rows, below the minimum of {min_rows}")]
    BelowMinimumRows { rows: usize, min_rows: usize },
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Incoming rows plus what the fetch that produced them knows.
#[derive(Debug, Clone, Default)]
pub struct MergeBatch {
    pub records: Vec<CanonicalRecord>,
    pub quality_score: Option<f64>,
    /// Date range the fetch covered; recorded in the metadata coverage.
    pub covered: Option<DateRange>,
}

impl MergeBatch {
    pub fn new(records: Vec<CanonicalRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub dataset: String,
    pub rows_before: usize,
    pub rows_incoming: usize,
    pub rows_after: usize,
    pub meta: DatasetMeta,
}

impl MergeResult {
    pub fn rows_added(&self) -> usize {
        self.rows_after.saturating_sub(self.rows_before)
    }
}

#[derive(Debug, Clone)]
pub struct StorageBridge {
    provider_priority: Vec<ProviderKind>,
    min_rows: usize,
    #[cfg(test)]
    fail_commit_at: Option<usize>,
}

impl Default for StorageBridge {
    fn default() -> Self {
        Self::new(ProviderKind::ALL.to_vec(), DEFAULT_MIN_ROWS)
    }
}

impl StorageBridge {
    /// `provider_priority` lists providers from most to least trusted.
    pub fn new(provider_priority: Vec<ProviderKind>, min_rows: usize) -> Self {
        Self {
            provider_priority,
            min_rows,
            #[cfg(test)]
            fail_commit_at: None,
        }
    }

    pub fn provider_priority(&self) -> &[ProviderKind] {
        &self.provider_priority
    }

    pub fn min_rows(&self) -> usize {
        self.min_rows
    }

    /// Load a dataset, falling back to the backup when the primary is missing
    /// or unreadable. An unreadable primary is moved aside as
    /// `.parquet.quarantined`. A dataset that does not exist loads as empty.
    pub fn load(&self, locator: &DatasetLocator) -> Result<Vec<CanonicalRecord>, StorageError> {
        self.load_from(locator).map(|(records, _)| records)
    }

    fn load_from(
        &self,
        locator: &DatasetLocator,
    ) -> Result<(Vec<CanonicalRecord>, LoadSource), StorageError> {
        let primary = locator.primary_path();
        let backup = locator.backup_path();
        restore_interrupted(&primary);
        restore_interrupted(&backup);

        if primary.exists() {
            match parquet::read(&primary) {
                Ok(records) => return Ok((records, LoadSource::Primary)),
                Err(e) => {
                    let quarantined = primary.with_extension("parquet.quarantined");
                    warn!(
                        dataset = %locator,
                        error = %e,
                        "primary file unreadable, quarantining and using backup"
                    );
                    fs::rename(&primary, &quarantined)
                        .map_err(|e| StorageError::io("quarantine", &primary, e))?;
                }
            }
        }

        if backup.exists() {
            let records = csv_backup::read(&backup)?;
            info!(dataset = %locator, rows = records.len(), "loaded dataset from backup");
            return Ok((records, LoadSource::Backup));
        }
        Ok((Vec::new(), LoadSource::Nothing))
    }

    /// Metadata to build on, given where the stored rows were found.
    fn previous_meta(&self, locator: &DatasetLocator, source: LoadSource) -> Option<DatasetMeta> {
        let previous = match self.read_meta(locator) {
            Ok(m) => m,
            Err(e) => {
                warn!(dataset = %locator, error = %e, "ignoring unreadable metadata");
                None
            }
        };
        match previous {
            // Rows the metadata describes are gone from both files; so is their coverage.
            Some(m) if source == LoadSource::Nothing && m.row_count > 0 => {
                warn!(
                    dataset = %locator,
                    rows = m.row_count,
                    "stored rows lost, discarding recorded coverage"
                );
                None
            }
            other => other,
        }
    }

    pub fn read_meta(&self, locator: &DatasetLocator) -> Result<Option<DatasetMeta>, StorageError> {
        meta::read(&locator.meta_path())
    }

    /// Merge `records` into the dataset at `locator`.
    pub fn merge(
        &self,
        locator: &DatasetLocator,
        records: Vec<CanonicalRecord>,
    ) -> Result<MergeResult, StorageError> {
        self.commit_batch(locator, MergeBatch::new(records))
    }

    /// Merge a batch and record its quality and coverage in the metadata.
    pub fn commit_batch(
        &self,
        locator: &DatasetLocator,
        batch: MergeBatch,
    ) -> Result<MergeResult, StorageError> {
        let dir = locator.dir();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io("create dir", &dir, e))?;

        let MergeBatch {
            records,
            quality_score,
            covered,
        } = batch;
        let (existing, source) = self.load_from(locator)?;
        let previous_meta = self.previous_meta(locator, source);
        let rows_before = existing.len();
        let rows_incoming = records.len();

        let merged = merge::dedup(existing, records, &self.provider_priority);
        if merged.len() < self.min_rows {
            return Err(StorageError::BelowMinimumRows {
                rows: merged.len(),
                min_rows: self.min_rows,
            });
        }

        let primary = locator.primary_path();
        let backup = locator.backup_path();
        let primary_tmp = primary.with_extension("parquet.tmp");
        let backup_tmp = backup.with_extension("csv.tmp");

        let staged = parquet::write(&merged, &primary_tmp)
            .and_then(|()| csv_backup::write(&merged, &backup_tmp));
        if let Err(e) = staged {
            let _ = fs::remove_file(&primary_tmp);
            let _ = fs::remove_file(&backup_tmp);
            return Err(e);
        }

        self.commit_files(&[(primary_tmp, primary), (backup_tmp, backup)])?;

        let today = Utc::now().date_naive();
        let meta = build_meta(locator, &merged, previous_meta, quality_score, covered, today)?;
        meta::write(&meta, &locator.meta_path())?;

        info!(
            dataset = %locator,
            rows_before,
            rows_incoming,
            rows_after = merged.len(),
            "merge committed"
        );

        Ok(MergeResult {
            dataset: locator.to_string(),
            rows_before,
            rows_incoming,
            rows_after: merged.len(),
            meta,
        })
    }

    /// Record that `covered` was fetched and held no bars. Only the metadata
    /// is written; data files are left as they are.
    pub fn record_empty_fetch(
        &self,
        locator: &DatasetLocator,
        covered: DateRange,
    ) -> Result<DatasetMeta, StorageError> {
        let dir = locator.dir();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io("create dir", &dir, e))?;

        let (existing, source) = self.load_from(locator)?;
        let previous_meta = self.previous_meta(locator, source);
        let today = Utc::now().date_naive();
        let meta = build_meta(locator, &existing, previous_meta, None, Some(covered), today)?;
        meta::write(&meta, &locator.meta_path())?;

        debug!(dataset = %locator, range = %covered, "recorded empty fetch");
        Ok(meta)
    }

    /// Move each staged file into place. On failure, every file already
    /// moved is put back the way it was.
    fn commit_files(&self, steps: &[(PathBuf, PathBuf)]) -> Result<(), StorageError> {
        let mut done: Vec<(&Path, Option<PathBuf>)> = Vec::with_capacity(steps.len());

        for (index, (tmp, target)) in steps.iter().enumerate() {
            match self.commit_one(index, tmp, target) {
                Ok(prev) => done.push((target.as_path(), prev)),
                Err(e) => {
                    for (target, prev) in done.iter().rev() {
                        match prev {
                            Some(prev) => {
                                let _ = fs::rename(prev, target);
                            }
                            None => {
                                let _ = fs::remove_file(target);
                            }
                        }
                    }
                    for (tmp, _) in steps {
                        let _ = fs::remove_file(tmp);
                    }
                    warn!(error = %e, "commit failed, previous files restored");
                    return Err(e);
                }
            }
        }

        for (_, prev) in done {
            if let Some(prev) = prev {
                let _ = fs::remove_file(prev);
            }
        }
        Ok(())
    }

    fn commit_one(
        &self,
        index: usize,
        tmp: &Path,
        target: &Path,
    ) -> Result<Option<PathBuf>, StorageError> {
        if let Some(e) = self.injected_failure(index, target) {
            return Err(e);
        }

        let prev = if target.exists() {
            let prev = prev_path(target);
            fs::rename(target, &prev).map_err(|e| StorageError::io("rename", target, e))?;
            Some(prev)
        } else {
            None
        };

        if let Err(e) = fs::rename(tmp, target) {
            if let Some(prev) = &prev {
                let _ = fs::rename(prev, target);
            }
            return Err(StorageError::io("rename", tmp, e));
        }
        debug!(step = index, path = %target.display(), "committed");
        Ok(prev)
    }

    #[cfg(test)]
    fn injected_failure(&self, index: usize, target: &Path) -> Option<StorageError> {
        (self.fail_commit_at == Some(index)).then(|| {
            StorageError::io(
                "rename",
                target,
                io::Error::new(io::ErrorKind::Other, "injected commit failure"),
            )
        })
    }

    #[cfg(not(test))]
    fn injected_failure(&self, _index: usize, _target: &Path) -> Option<StorageError> {
        None
    }

    /// Metadata of every dataset under `root`, ordered by locator.
    pub fn list(root: &Path) -> Result<Vec<DatasetMeta>, StorageError> {
        let mut out = Vec::new();
        if !root.is_dir() {
            return Ok(out);
        }
        for type_dir in subdirs(root)? {
            for period_dir in subdirs(&type_dir)? {
                let is_period = period_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.parse::<Period>().is_ok());
                if !is_period {
                    continue;
                }
                let entries = fs::read_dir(&period_dir)
                    .map_err(|e| StorageError::io("read dir", &period_dir, e))?;
                for entry in entries {
                    let path = entry
                        .map_err(|e| StorageError::io("read dir", &period_dir, e))?
                        .path();
                    let is_meta = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(".meta.json"));
                    if is_meta {
                        if let Some(m) = meta::read(&path)? {
                            out.push(m);
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.instrument_type, a.period, &a.symbol).cmp(&(&b.instrument_type, b.period, &b.symbol))
        });
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadSource {
    Primary,
    Backup,
    Nothing,
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StorageError::io("read dir", dir, e))? {
        let path = entry.map_err(|e| StorageError::io("read dir", dir, e))?.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn prev_path(target: &Path) -> PathBuf {
    let ext = target
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    target.with_extension(format!("{ext}.prev"))
}

/// A crash between moving the old file aside and moving the new one in
/// leaves only `.prev`; put it back.
fn restore_interrupted(target: &Path) {
    let prev = prev_path(target);
    if prev.exists() {
        if target.exists() {
            let _ = fs::remove_file(&prev);
        } else if fs::rename(&prev, target).is_ok() {
            warn!(path = %target.display(), "restored file from interrupted commit");
        }
    }
}

fn build_meta(
    locator: &DatasetLocator,
    merged: &[CanonicalRecord],
    previous: Option<DatasetMeta>,
    quality_score: Option<f64>,
    covered: Option<DateRange>,
    today: NaiveDate,
) -> Result<meta::DatasetMeta, StorageError> {
    let (mut coverage, previous_quality) = previous
        .map(|m| (m.coverage, m.quality_score))
        .unwrap_or_default();
    // Today's bars may still change, so coverage stops before the fetch date.
    if let Some(range) = covered.and_then(|r| r.clamp_end(today)) {
        coverage.insert(range);
    }

    Ok(DatasetMeta {
        symbol: locator.symbol().to_string(),
        instrument_type: locator.instrument_type().to_string(),
        period: locator.period(),
        row_count: merged.len(),
        first_timestamp: merged.first().map(|r| r.timestamp),
        last_timestamp: merged.last().map(|r| r.timestamp),
        coverage,
        last_updated: Utc::now(),
        quality_score: quality_score.or(previous_quality),
        data_hash: meta::data_hash(merged)?,
        providers: meta::provider_counts(merged),
        schema_version: SCHEMA_VERSION,
    })
}
