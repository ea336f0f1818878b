//! Executes planned jobs across provider lanes.
//!
//! Each lane owns the adapters and resilience controllers of its providers and
//! runs its jobs in submission order. Lanes run concurrently on a bounded
//! rayon pool. A failing job never stops its siblings: every job yields
//! exactly one [`JobResult`].

use chrono::Utc;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use pricevault_core::domain::{CorrelationId, DownloadJob, JobStatus, ProviderKind};
use pricevault_core::error::ProviderError;
use pricevault_core::events::{EventSink, PipelineEvent};
use pricevault_core::provider::{
    BarchartAdapter, Credentials, FetchRequest, GatewayAdapter, Provider, ProviderAdapter,
    RawPayload, YahooAdapter,
};
use pricevault_core::resilience::{
    BreakerConfig, CancelToken, ResilienceController, ResilienceError, RetryPolicy,
};
use pricevault_core::storage::{MergeBatch, StorageBridge};
use pricevault_core::transform::{transform, FieldMap, QualityPolicy, SchemaError};

use crate::config::{ProviderSettings, RunConfig};
use crate::credentials::CredentialSource;
use crate::lane::{build_lanes, Lane};
use crate::plan::Plan;
use crate::summary::{FailureReason, JobResult, RunSummary};

/// Builds one adapter per provider for a run.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind) -> Result<Provider, ProviderError>;
}

impl<F> ProviderFactory for F
where
    F: Fn(ProviderKind) -> Result<Provider, ProviderError> + Send + Sync,
{
    fn create(&self, kind: ProviderKind) -> Result<Provider, ProviderError> {
        self(kind)
    }
}

/// Network-backed adapters built from the run config.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredProviders {
    settings: ProviderSettings,
}

impl ConfiguredProviders {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

impl ProviderFactory for ConfiguredProviders {
    fn create(&self, kind: ProviderKind) -> Result<Provider, ProviderError> {
        Ok(match kind {
            ProviderKind::Barchart => {
                Provider::Barchart(BarchartAdapter::new(self.settings.barchart.adapter_config())?)
            }
            ProviderKind::Yahoo => {
                Provider::Yahoo(YahooAdapter::new(self.settings.yahoo.adapter_config())?)
            }
            ProviderKind::Gateway => {
                Provider::Gateway(GatewayAdapter::new(self.settings.gateway.adapter_config()))
            }
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSettings {
    /// Lane worker threads. `None` means one per provider in the run.
    pub workers: Option<usize>,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub quality: QualityPolicy,
    pub seed: Option<u64>,
}

impl RunSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            workers: config.workers,
            breaker: config.resilience.breaker(),
            retry: config.resilience.retry(),
            quality: config.quality,
            seed: config.seed,
        }
    }
}

pub struct Orchestrator {
    settings: RunSettings,
    storage: StorageBridge,
    factory: Box<dyn ProviderFactory>,
    credentials: Box<dyn CredentialSource>,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        storage: StorageBridge,
        factory: impl ProviderFactory + 'static,
        credentials: impl CredentialSource + 'static,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            settings,
            storage,
            factory: Box::new(factory),
            credentials: Box::new(credentials),
            sink,
            cancel: CancelToken::new(),
        }
    }

    /// Orchestrator with network adapters for everything in `config`.
    pub fn from_config(
        config: &RunConfig,
        credentials: impl CredentialSource + 'static,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(
            RunSettings::from_config(config),
            config.storage.bridge(),
            ConfiguredProviders::new(config.providers.clone()),
            credentials,
            sink,
        )
    }

    pub fn storage(&self) -> &StorageBridge {
        &self.storage
    }

    /// Handle for cancelling a run from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run a plan; skipped segments are reported as events and in the summary.
    pub fn run_plan(&self, plan: Plan) -> RunSummary {
        let correlation_id = CorrelationId::new();
        for seg in &plan.skipped {
            self.sink.emit(&PipelineEvent::SegmentSkipped {
                correlation_id: correlation_id.clone(),
                dataset: seg.dataset.clone(),
                provider: seg.provider,
                range: seg.range.to_string(),
                reason: seg.reason.to_string(),
            });
        }
        self.run(plan.jobs).with_skipped(plan.skipped)
    }

    /// Run jobs to completion. Never fails as a whole.
    pub fn run(&self, jobs: Vec<DownloadJob>) -> RunSummary {
        let started_at = Utc::now();
        let lanes = build_lanes(jobs);
        let providers: usize = lanes.iter().map(|l| l.providers.len()).sum();
        let workers = self.settings.workers.unwrap_or(providers).max(1);
        info!(lanes = lanes.len(), workers, "starting run");

        let per_lane: Vec<Vec<JobResult>> =
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(|| {
                    lanes
                        .into_par_iter()
                        .map(|lane| self.run_lane(lane))
                        .collect()
                }),
                Err(e) => {
                    warn!(error = %e, "worker pool unavailable, running lanes sequentially");
                    lanes.into_iter().map(|lane| self.run_lane(lane)).collect()
                }
            };

        let summary = RunSummary::new(started_at, Utc::now(), per_lane.into_iter().flatten().collect());
        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "run finished"
        );
        summary
    }

    fn run_lane(&self, lane: Lane) -> Vec<JobResult> {
        let mut slots: Vec<(ProviderKind, Result<ProviderSlot, FailureReason>)> = lane
            .providers
            .iter()
            .map(|&kind| (kind, self.open_slot(kind)))
            .collect();

        lane.jobs
            .iter()
            .map(|job| {
                let slot = slots
                    .iter_mut()
                    .find(|(kind, _)| *kind == job.provider)
                    .map(|(_, slot)| slot);
                match slot {
                    Some(Ok(slot)) => self.run_job(slot, job),
                    Some(Err(reason)) => {
                        let reason = reason.clone();
                        self.fail(job, &CorrelationId::new(), Instant::now(), Outcome::default(), reason)
                    }
                    // Lanes are built from their jobs' providers.
                    None => self.fail(
                        job,
                        &CorrelationId::new(),
                        Instant::now(),
                        Outcome::default(),
                        FailureReason::ProviderUnavailable("no adapter in lane".into()),
                    ),
                }
            })
            .collect()
    }

    fn open_slot(&self, kind: ProviderKind) -> Result<ProviderSlot, FailureReason> {
        let provider = self.factory.create(kind).map_err(|e| {
            warn!(provider = %kind, error = %e, "provider unavailable");
            FailureReason::ProviderUnavailable(e.to_string())
        })?;
        let mut controller = ResilienceController::new(
            kind,
            self.settings.breaker.clone(),
            self.settings.retry.clone(),
            self.sink.clone(),
        );
        if let Some(seed) = self.settings.seed {
            controller = controller.with_seed(seed.wrapping_add(kind as u64));
        }
        Ok(ProviderSlot {
            kind,
            provider,
            controller,
            credentials: None,
            authenticated: false,
            disabled: None,
        })
    }

    fn run_job(&self, slot: &mut ProviderSlot, job: &DownloadJob) -> JobResult {
        let started = Instant::now();
        let cid = CorrelationId::new();
        let mut outcome = Outcome::default();

        if self.cancel.is_cancelled() {
            return self.fail(job, &cid, started, outcome, FailureReason::Cancelled);
        }
        self.sink.emit(&PipelineEvent::JobStarted {
            correlation_id: cid.clone(),
            job_id: job.id,
            provider: job.provider,
            symbol: job.symbol().to_string(),
            range: job.range.to_string(),
        });

        let payload = match self.fetch(slot, job, &cid, &mut outcome) {
            Ok(payload) => payload,
            Err(reason) => return self.fail(job, &cid, started, outcome, reason),
        };

        let output = match transform(&payload, FieldMap::for_provider(job.provider), &self.settings.quality) {
            Ok(output) => output,
            Err(e) => {
                if let SchemaError::QualityBelowThreshold { report, .. } = &e {
                    outcome.rows_fetched = report.total_rows;
                    outcome.quality_score = Some(report.quality_score);
                }
                return self.fail(job, &cid, started, outcome, e.into());
            }
        };
        outcome.rows_fetched = output.report.total_rows;
        outcome.quality_score = Some(output.report.quality_score);

        if output.records.is_empty() {
            debug!(job = %job.id, "provider returned no bars");
            return match self.storage.record_empty_fetch(&job.locator, job.range) {
                Ok(_) => self.succeed(job, &cid, started, outcome),
                Err(e) => self.fail(job, &cid, started, outcome, e.into()),
            };
        }

        let batch = MergeBatch {
            records: output.records,
            quality_score: Some(output.report.quality_score),
            covered: Some(job.range),
        };
        match self.storage.commit_batch(&job.locator, batch) {
            Ok(merged) => {
                outcome.rows_persisted = merged.rows_incoming;
                self.sink.emit(&PipelineEvent::MergeCommitted {
                    correlation_id: cid.clone(),
                    dataset: merged.dataset,
                    rows_before: merged.rows_before,
                    rows_after: merged.rows_after,
                    at: Utc::now(),
                });
                self.succeed(job, &cid, started, outcome)
            }
            Err(e) => self.fail(job, &cid, started, outcome, e.into()),
        }
    }

    /// Authenticate if needed, then fetch through the controller. An
    /// authentication failure mid-fetch gets one re-authentication and one
    /// more fetch.
    fn fetch(
        &self,
        slot: &mut ProviderSlot,
        job: &DownloadJob,
        cid: &CorrelationId,
        outcome: &mut Outcome,
    ) -> Result<RawPayload, FailureReason> {
        if let Some(reason) = &slot.disabled {
            return Err(reason.clone());
        }
        let credentials = match &slot.credentials {
            Some(c) => c.clone(),
            None => match self.credentials.credentials(slot.kind) {
                Ok(c) => {
                    slot.credentials = Some(c.clone());
                    c
                }
                Err(e) => {
                    let reason = FailureReason::Credentials(e.to_string());
                    slot.disabled = Some(reason.clone());
                    return Err(reason);
                }
            },
        };

        if !slot.authenticated {
            self.authenticate(slot, &credentials, cid)?;
        }

        let request = FetchRequest {
            instrument: job.instrument.as_ref(),
            period: job.period,
            range: job.range,
        };
        match slot.fetch(&request, cid, &self.cancel, outcome) {
            Err(ResilienceError::Provider(ProviderError::Authentication(msg))) => {
                debug!(provider = %slot.kind, reason = msg.as_str(), "session rejected, re-authenticating");
                let renewed = self.authenticate(slot, &credentials, cid);
                self.sink.emit(&PipelineEvent::Reauthenticated {
                    correlation_id: cid.clone(),
                    provider: slot.kind,
                    success: renewed.is_ok(),
                });
                renewed?;
                slot.fetch(&request, cid, &self.cancel, outcome)
                    .map_err(FailureReason::from)
            }
            other => other.map_err(FailureReason::from),
        }
    }

    /// Rejected credentials disable the provider for the rest of the run.
    fn authenticate(
        &self,
        slot: &mut ProviderSlot,
        credentials: &Credentials,
        cid: &CorrelationId,
    ) -> Result<(), FailureReason> {
        slot.authenticated = false;
        let provider = &mut slot.provider;
        let result = slot
            .controller
            .execute(cid, &self.cancel, || provider.authenticate(credentials));
        match result {
            Ok(true) => {
                slot.authenticated = true;
                debug!(provider = %slot.kind, "authenticated");
                Ok(())
            }
            Ok(false) => {
                let reason = FailureReason::Authentication(format!(
                    "{} rejected the credentials",
                    slot.kind
                ));
                slot.disabled = Some(reason.clone());
                Err(reason)
            }
            Err(ResilienceError::Provider(e @ ProviderError::Authentication(_))) => {
                let reason = FailureReason::from(e);
                slot.disabled = Some(reason.clone());
                Err(reason)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn succeed(
        &self,
        job: &DownloadJob,
        cid: &CorrelationId,
        started: Instant,
        outcome: Outcome,
    ) -> JobResult {
        self.sink.emit(&PipelineEvent::JobSucceeded {
            correlation_id: cid.clone(),
            job_id: job.id,
            rows_fetched: outcome.rows_fetched,
            rows_persisted: outcome.rows_persisted,
            quality_score: outcome.quality_score.unwrap_or(1.0),
        });
        outcome.into_result(job, cid, JobStatus::Succeeded, None, started)
    }

    fn fail(
        &self,
        job: &DownloadJob,
        cid: &CorrelationId,
        started: Instant,
        outcome: Outcome,
        reason: FailureReason,
    ) -> JobResult {
        self.sink.emit(&PipelineEvent::JobFailed {
            correlation_id: cid.clone(),
            job_id: job.id,
            reason: reason.to_string(),
        });
        outcome.into_result(job, cid, JobStatus::Failed, Some(reason), started)
    }
}

/// Per-provider state owned by one lane.
struct ProviderSlot {
    kind: ProviderKind,
    provider: Provider,
    controller: ResilienceController,
    credentials: Option<Credentials>,
    authenticated: bool,
    /// Set once the provider cannot serve any more jobs in this run.
    disabled: Option<FailureReason>,
}

impl ProviderSlot {
    fn fetch(
        &mut self,
        request: &FetchRequest<'_>,
        cid: &CorrelationId,
        cancel: &CancelToken,
        outcome: &mut Outcome,
    ) -> Result<RawPayload, ResilienceError> {
        let provider = &mut self.provider;
        let result = self
            .controller
            .execute(cid, cancel, || provider.fetch_raw(request));
        outcome.attempts += self.controller.last_attempts();
        result
    }
}

#[derive(Debug, Default)]
struct Outcome {
    rows_fetched: usize,
    rows_persisted: usize,
    quality_score: Option<f64>,
    attempts: u32,
}

impl Outcome {
    fn into_result(
        self,
        job: &DownloadJob,
        cid: &CorrelationId,
        status: JobStatus,
        failure: Option<FailureReason>,
        started: Instant,
    ) -> JobResult {
        JobResult {
            job_id: job.id,
            correlation_id: cid.clone(),
            provider: job.provider,
            symbol: job.symbol().to_string(),
            period: job.period,
            range: job.range,
            status,
            rows_fetched: self.rows_fetched,
            rows_persisted: self.rows_persisted,
            quality_score: self.quality_score,
            attempts: self.attempts,
            failure,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
