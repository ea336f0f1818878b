//! Per-job results and the run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use pricevault_core::domain::{CorrelationId, DateRange, JobId, JobStatus, Period, ProviderKind};
use pricevault_core::error::ProviderError;
use pricevault_core::resilience::ResilienceError;
use pricevault_core::storage::StorageError;
use pricevault_core::transform::SchemaError;

use crate::plan::SkippedSegment;

/// Why a job failed. Serializable, so it survives into the summary JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Authentication(String),
    RateLimited(String),
    NotFound(String),
    Transport(String),
    Timeout(String),
    Server(String),
    Malformed(String),
    Schema(String),
    Storage(String),
    CircuitOpen(String),
    Credentials(String),
    ProviderUnavailable(String),
    Cancelled,
}

impl FailureReason {
    /// Stable short label, used in tables and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Authentication(_) => "authentication",
            FailureReason::RateLimited(_) => "rate_limited",
            FailureReason::NotFound(_) => "not_found",
            FailureReason::Transport(_) => "transport",
            FailureReason::Timeout(_) => "timeout",
            FailureReason::Server(_) => "server",
            FailureReason::Malformed(_) => "malformed",
            FailureReason::Schema(_) => "schema",
            FailureReason::Storage(_) => "storage",
            FailureReason::CircuitOpen(_) => "circuit_open",
            FailureReason::Credentials(_) => "credentials",
            FailureReason::ProviderUnavailable(_) => "provider_unavailable",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Authentication(d)
            | FailureReason::RateLimited(d)
            | FailureReason::NotFound(d)
            | FailureReason::Transport(d)
            | FailureReason::Timeout(d)
            | FailureReason::Server(d)
            | FailureReason::Malformed(d)
            | FailureReason::Schema(d)
            | FailureReason::Storage(d)
            | FailureReason::CircuitOpen(d)
            | FailureReason::Credentials(d)
            | FailureReason::ProviderUnavailable(d) => write!(f, "{}: {d}", self.label()),
        }
    }
}

impl From<&ProviderError> for FailureReason {
    fn from(e: &ProviderError) -> Self {
        let detail = e.to_string();
        match e {
            ProviderError::Authentication(_) => FailureReason::Authentication(detail),
            ProviderError::RateLimited { .. } => FailureReason::RateLimited(detail),
            ProviderError::NotFound { .. } => FailureReason::NotFound(detail),
            ProviderError::Transport(_) => FailureReason::Transport(detail),
            ProviderError::Timeout(_) => FailureReason::Timeout(detail),
            ProviderError::Server { .. } => FailureReason::Server(detail),
            ProviderError::Malformed(_) => FailureReason::Malformed(detail),
        }
    }
}

impl From<ProviderError> for FailureReason {
    fn from(e: ProviderError) -> Self {
        FailureReason::from(&e)
    }
}

impl From<ResilienceError> for FailureReason {
    fn from(e: ResilienceError) -> Self {
        match e {
            ResilienceError::CircuitOpen(open) => FailureReason::CircuitOpen(open.to_string()),
            ResilienceError::Provider(err) => err.into(),
            ResilienceError::Cancelled => FailureReason::Cancelled,
        }
    }
}

impl From<SchemaError> for FailureReason {
    fn from(e: SchemaError) -> Self {
        FailureReason::Schema(e.to_string())
    }
}

impl From<StorageError> for FailureReason {
    fn from(e: StorageError) -> Self {
        FailureReason::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub correlation_id: CorrelationId,
    pub provider: ProviderKind,
    pub symbol: String,
    pub period: Period,
    pub range: DateRange,
    pub status: JobStatus,
    pub rows_fetched: usize,
    pub rows_persisted: usize,
    pub quality_score: Option<f64>,
    /// Provider calls made for the fetch, retries and the re-authenticated repeat included.
    pub attempts: u32,
    pub failure: Option<FailureReason>,
    pub duration_ms: u64,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per job, ordered by job id.
    pub results: Vec<JobResult>,
    pub skipped: Vec<SkippedSegment>,
}

impl RunSummary {
    pub fn new(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        mut results: Vec<JobResult>,
    ) -> Self {
        results.sort_by_key(|r| r.job_id);
        Self {
            started_at,
            finished_at,
            results,
            skipped: Vec::new(),
        }
    }

    /// Attach the segments the plan skipped.
    pub fn with_skipped(mut self, skipped: Vec<SkippedSegment>) -> Self {
        self.skipped = skipped;
        self
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == JobStatus::Failed)
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn rows_persisted(&self) -> usize {
        self.results.iter().map(|r| r.rows_persisted).sum()
    }

    pub fn result(&self, job_id: JobId) -> Option<&JobResult> {
        self.results
            .binary_search_by_key(&job_id, |r| r.job_id)
            .ok()
            .map(|i| &self.results[i])
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped ({} rows persisted)",
            self.succeeded(),
            self.failed(),
            self.skipped.len(),
            self.rows_persisted()
        )
    }
}
