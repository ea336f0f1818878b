use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::{DatasetLocator, DateRange, Instrument, JobId, Period, ProviderKind};

/// Lifecycle of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One provider-bounded chunk of work: fetch `range` of `instrument` at `period`
/// from `provider` and merge it into the dataset at `locator`.
///
/// Jobs are immutable; a status change produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub instrument: Arc<Instrument>,
    pub period: Period,
    pub range: DateRange,
    pub provider: ProviderKind,
    pub locator: DatasetLocator,
    pub status: JobStatus,
}

impl DownloadJob {
    pub fn new(
        id: JobId,
        instrument: Arc<Instrument>,
        period: Period,
        range: DateRange,
        provider: ProviderKind,
        locator: DatasetLocator,
    ) -> Self {
        Self {
            id,
            instrument,
            period,
            range,
            provider,
            locator,
            status: JobStatus::Pending,
        }
    }

    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn symbol(&self) -> &str {
        self.instrument.symbol()
    }
}

impl fmt::Display for DownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} via {}",
            self.id,
            self.instrument.symbol(),
            self.period,
            self.range,
            self.provider
        )
    }
}
