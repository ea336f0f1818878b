//! Job planning: turn download requests into provider-sized jobs.
//!
//! Planning is deterministic. For a given config and on-disk metadata the
//! same jobs come out in the same order with the same ids.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use pricevault_core::domain::{
    Coverage, DatasetLocator, DateRange, DownloadJob, JobId, ProviderKind,
};
use pricevault_core::storage::StorageBridge;

use crate::config::{ConfigError, DownloadRequest, RunConfig};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Dataset metadata already records the whole segment as fetched.
    AlreadyCovered,
    /// The request ends before the instrument's first available date.
    BeforeFirstAvailableDate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::AlreadyCovered => "already covered",
            SkipReason::BeforeFirstAvailableDate => "before first available date",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSegment {
    pub dataset: String,
    pub provider: ProviderKind,
    pub range: DateRange,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub jobs: Vec<DownloadJob>,
    pub skipped: Vec<SkippedSegment>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Distinct providers with at least one job, in first-use order.
    pub fn providers(&self) -> Vec<ProviderKind> {
        let mut out: Vec<ProviderKind> = Vec::new();
        for job in &self.jobs {
            if !out.contains(&job.provider) {
                out.push(job.provider);
            }
        }
        out
    }
}

/// Plan every download in `config`, skipping segments already on disk.
pub fn plan(config: &RunConfig, storage: &StorageBridge) -> Result<Plan, PlanError> {
    plan_requests(&config.requests()?, storage)
}

/// Plan already-resolved requests.
///
/// Each requested range is clamped to the instrument's first available date
/// and cut into segments no longer than the provider allows for the period.
/// Segments whose dates are all recorded in the dataset's coverage are
/// skipped. Job ids start at 1 and follow request order, then period order,
/// then date order.
pub fn plan_requests(
    requests: &[DownloadRequest],
    storage: &StorageBridge,
) -> Result<Plan, PlanError> {
    let mut plan = Plan::default();
    let mut coverage: HashMap<DatasetLocator, Coverage> = HashMap::new();
    let mut next_id = 1u64;

    for request in requests {
        for &period in &request.periods {
            let max_days = request.provider.max_span_days(period);
            let locator = DatasetLocator::new(&request.output_root, &request.instrument, period);

            let Some(range) = request.range.clamp_start(request.instrument.first_date()) else {
                plan.skipped.push(SkippedSegment {
                    dataset: locator.to_string(),
                    provider: request.provider,
                    range: request.range,
                    reason: SkipReason::BeforeFirstAvailableDate,
                });
                continue;
            };

            let covered = coverage
                .entry(locator.clone())
                .or_insert_with(|| existing_coverage(storage, &locator));

            for chunk in range.chunks(max_days) {
                if covered.covers(&chunk) {
                    plan.skipped.push(SkippedSegment {
                        dataset: locator.to_string(),
                        provider: request.provider,
                        range: chunk,
                        reason: SkipReason::AlreadyCovered,
                    });
                    continue;
                }
                plan.jobs.push(DownloadJob::new(
                    JobId(next_id),
                    request.instrument.clone(),
                    period,
                    chunk,
                    request.provider,
                    locator.clone(),
                ));
                next_id += 1;
            }
        }
    }

    debug!(jobs = plan.jobs.len(), skipped = plan.skipped.len(), "plan built");
    Ok(plan)
}

fn existing_coverage(storage: &StorageBridge, locator: &DatasetLocator) -> Coverage {
    match storage.read_meta(locator) {
        Ok(Some(meta)) => meta.coverage,
        Ok(None) => Coverage::new(),
        Err(e) => {
            // Re-fetching is always safe; merges are idempotent.
            warn!(dataset = %locator, error = %e, "unreadable metadata, planning full range");
            Coverage::new()
        }
    }
}
