//! Structured pipeline events.
//!
//! Every event carries the correlation id of the job that produced it.
//! Sinks decide what to do with them; the pipeline never formats output itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::{CorrelationId, JobId, ProviderKind};
use crate::resilience::CircuitState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobStarted {
        correlation_id: CorrelationId,
        job_id: JobId,
        provider: ProviderKind,
        symbol: String,
        range: String,
    },
    JobSucceeded {
        correlation_id: CorrelationId,
        job_id: JobId,
        rows_fetched: usize,
        rows_persisted: usize,
        quality_score: f64,
    },
    JobFailed {
        correlation_id: CorrelationId,
        job_id: JobId,
        reason: String,
    },
    SegmentSkipped {
        correlation_id: CorrelationId,
        dataset: String,
        provider: ProviderKind,
        range: String,
        reason: String,
    },
    RetryScheduled {
        correlation_id: CorrelationId,
        provider: ProviderKind,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    CircuitTransition {
        correlation_id: CorrelationId,
        provider: ProviderKind,
        from: CircuitState,
        to: CircuitState,
    },
    Reauthenticated {
        correlation_id: CorrelationId,
        provider: ProviderKind,
        success: bool,
    },
    MergeCommitted {
        correlation_id: CorrelationId,
        dataset: String,
        rows_before: usize,
        rows_after: usize,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            PipelineEvent::JobStarted { correlation_id, .. }
            | PipelineEvent::JobSucceeded { correlation_id, .. }
            | PipelineEvent::JobFailed { correlation_id, .. }
            | PipelineEvent::SegmentSkipped { correlation_id, .. }
            | PipelineEvent::RetryScheduled { correlation_id, .. }
            | PipelineEvent::CircuitTransition { correlation_id, .. }
            | PipelineEvent::Reauthenticated { correlation_id, .. }
            | PipelineEvent::MergeCommitted { correlation_id, .. } => correlation_id,
        }
    }

    pub(crate) fn retry(
        correlation_id: &CorrelationId,
        provider: ProviderKind,
        attempt: u32,
        delay: Duration,
        error: &impl ToString,
    ) -> Self {
        PipelineEvent::RetryScheduled {
            correlation_id: correlation_id.clone(),
            provider,
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        }
    }
}

/// Receiver for pipeline events. Implementations must be cheap and non-blocking.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        let cid = event.correlation_id().as_str();
        match event {
            PipelineEvent::JobStarted {
                job_id,
                provider,
                symbol,
                range,
                ..
            } => tracing::info!(
                correlation_id = cid,
                %job_id,
                %provider,
                symbol = symbol.as_str(),
                range = range.as_str(),
                "job started"
            ),
            PipelineEvent::JobSucceeded {
                job_id,
                rows_fetched,
                rows_persisted,
                quality_score,
                ..
            } => tracing::info!(
                correlation_id = cid,
                %job_id,
                rows_fetched,
                rows_persisted,
                quality_score,
                "job succeeded"
            ),
            PipelineEvent::JobFailed { job_id, reason, .. } => {
                tracing::warn!(correlation_id = cid, %job_id, reason = reason.as_str(), "job failed")
            }
            PipelineEvent::SegmentSkipped {
                dataset,
                provider,
                range,
                reason,
                ..
            } => tracing::info!(
                correlation_id = cid,
                dataset = dataset.as_str(),
                %provider,
                range = range.as_str(),
                reason = reason.as_str(),
                "segment skipped"
            ),
            PipelineEvent::RetryScheduled {
                provider,
                attempt,
                delay_ms,
                error,
                ..
            } => tracing::debug!(
                correlation_id = cid,
                %provider,
                attempt,
                delay_ms,
                error = error.as_str(),
                "retry scheduled"
            ),
            PipelineEvent::CircuitTransition { provider, from, to, .. } => tracing::warn!(
                correlation_id = cid,
                %provider,
                from = %from,
                to = %to,
                "circuit transition"
            ),
            PipelineEvent::Reauthenticated { provider, success, .. } => {
                tracing::info!(correlation_id = cid, %provider, success, "re-authenticated")
            }
            PipelineEvent::MergeCommitted {
                dataset,
                rows_before,
                rows_after,
                ..
            } => tracing::info!(
                correlation_id = cid,
                dataset = dataset.as_str(),
                rows_before,
                rows_after,
                "merge committed"
            ),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &PipelineEvent) {}
}

/// Collects events in memory (tests, post-run inspection).
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn count(&self, pred: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &PipelineEvent) {
        let mut guard = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        let cid = CorrelationId::from_str_id("abc");
        sink.emit(&PipelineEvent::JobFailed {
            correlation_id: cid.clone(),
            job_id: JobId(1),
            reason: "boom".into(),
        });
        sink.emit(&PipelineEvent::Reauthenticated {
            correlation_id: cid.clone(),
            provider: ProviderKind::Barchart,
            success: true,
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.correlation_id() == &cid));
        assert_eq!(
            sink.count(|e| matches!(e, PipelineEvent::JobFailed { .. })),
            1
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = PipelineEvent::JobFailed {
            correlation_id: CorrelationId::from_str_id("x"),
            job_id: JobId(3),
            reason: "not found".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"job_failed\""));
    }
}
