//! Retry-around-breaker composition for one provider lane.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use thiserror::Error;

use super::{BreakerConfig, CallError, CancelToken, CircuitBreaker, CircuitState, RetryPolicy};
use crate::domain::{CorrelationId, ProviderKind};
use crate::error::{CircuitOpenError, ProviderError};
use crate::events::{EventSink, PipelineEvent};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResilienceError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cancelled")]
    Cancelled,
}

/// Guards every call to one provider: each attempt passes through the
/// breaker, failed attempts are retried per the policy.
pub struct ResilienceController {
    provider: ProviderKind,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    rng: StdRng,
    sink: Arc<dyn EventSink>,
    last_attempts: u32,
}

impl ResilienceController {
    pub fn new(
        provider: ProviderKind,
        breaker: BreakerConfig,
        policy: RetryPolicy,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            provider,
            breaker: CircuitBreaker::new(provider, breaker),
            policy,
            rng: StdRng::from_entropy(),
            sink,
            last_attempts: 0,
        }
    }

    /// Fix the jitter sequence (tests, reproducible runs).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn allows_call(&self) -> bool {
        self.breaker.would_allow()
    }

    /// Attempts made by the most recent `execute`.
    pub fn last_attempts(&self) -> u32 {
        self.last_attempts
    }

    pub fn execute<T>(
        &mut self,
        correlation_id: &CorrelationId,
        cancel: &CancelToken,
        mut op: impl FnMut() -> Result<T, ProviderError>,
    ) -> Result<T, ResilienceError> {
        self.last_attempts = 0;
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            let result = self.breaker.execute(&mut op);
            if !matches!(result, Err(CallError::Open(_))) {
                self.last_attempts += 1;
            }
            self.flush_transitions(correlation_id);

            let err = match result {
                Ok(value) => return Ok(value),
                Err(CallError::Open(open)) => return Err(open.into()),
                Err(CallError::Failed(err)) => err,
            };

            let Some(delay) = self
                .policy
                .next_delay(attempt, &err, Utc::now(), &mut self.rng)
            else {
                return Err(err.into());
            };
            self.sink.emit(&PipelineEvent::retry(
                correlation_id,
                self.provider,
                attempt + 1,
                delay,
                &err,
            ));
            if !cancel.sleep(delay) {
                return Err(ResilienceError::Cancelled);
            }
            attempt += 1;
        }
    }

    fn flush_transitions(&mut self, correlation_id: &CorrelationId) {
        for t in self.breaker.take_transitions() {
            self.sink.emit(&PipelineEvent::CircuitTransition {
                correlation_id: correlation_id.clone(),
                provider: self.provider,
                from: t.from,
                to: t.to,
            });
        }
    }
}

impl std::fmt::Debug for ResilienceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceController")
            .field("provider", &self.provider)
            .field("breaker", &self.breaker)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use std::time::Duration;

    fn controller(threshold: u32, retries: u32, sink: Arc<MemorySink>) -> ResilienceController {
        ResilienceController::new(
            ProviderKind::Yahoo,
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(60),
            },
            RetryPolicy {
                max_retries: retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter: 0.25,
                max_rate_limit_wait: Duration::from_millis(50),
            },
            sink,
        )
        .with_seed(42)
    }

    #[test]
    fn transient_failure_then_success() {
        let sink = Arc::new(MemorySink::new());
        let mut ctl = controller(5, 3, sink.clone());
        let cid = CorrelationId::from_str_id("t1");
        let mut calls = 0;
        let out = ctl.execute(&cid, &CancelToken::new(), || {
            calls += 1;
            if calls < 3 {
                Err(ProviderError::Server {
                    status: 503,
                    message: "busy".into(),
                })
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out, Ok(3));
        assert_eq!(ctl.last_attempts(), 3);
        assert_eq!(
            sink.count(|e| matches!(e, PipelineEvent::RetryScheduled { .. })),
            2
        );
        assert_eq!(ctl.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn not_found_is_not_retried() {
        let sink = Arc::new(MemorySink::new());
        let mut ctl = controller(5, 3, sink.clone());
        let mut calls = 0;
        let out: Result<(), _> =
            ctl.execute(&CorrelationId::from_str_id("t2"), &CancelToken::new(), || {
                calls += 1;
                Err(ProviderError::NotFound {
                    symbol: "NOPE".into(),
                })
            });
        assert!(matches!(out, Err(ResilienceError::Provider(ProviderError::NotFound { .. }))));
        assert_eq!(calls, 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn retries_inside_one_job_can_open_the_circuit() {
        let sink = Arc::new(MemorySink::new());
        let mut ctl = controller(2, 5, sink.clone());
        let mut calls = 0;
        let out: Result<(), _> =
            ctl.execute(&CorrelationId::from_str_id("t3"), &CancelToken::new(), || {
                calls += 1;
                Err(ProviderError::Transport("reset".into()))
            });
        assert!(matches!(out, Err(ResilienceError::CircuitOpen(_))));
        assert_eq!(calls, 2);
        assert_eq!(ctl.last_attempts(), 2);
        assert_eq!(
            sink.count(|e| matches!(
                e,
                PipelineEvent::CircuitTransition {
                    to: CircuitState::Open,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn rate_limit_waits_then_succeeds_without_tripping() {
        let sink = Arc::new(MemorySink::new());
        let mut ctl = controller(1, 2, sink.clone());
        let mut calls = 0;
        let out = ctl.execute(&CorrelationId::from_str_id("t4"), &CancelToken::new(), || {
            calls += 1;
            if calls == 1 {
                Err(ProviderError::RateLimited {
                    reset_at: Utc::now() + chrono::Duration::milliseconds(10),
                })
            } else {
                Ok("ok")
            }
        });
        assert_eq!(out, Ok("ok"));
        assert_eq!(ctl.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn cancelled_before_first_attempt() {
        let sink = Arc::new(MemorySink::new());
        let mut ctl = controller(5, 3, sink);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut calls = 0;
        let out: Result<(), _> = ctl.execute(&CorrelationId::from_str_id("t5"), &cancel, || {
            calls += 1;
            Ok(())
        });
        assert_eq!(out, Err(ResilienceError::Cancelled));
        assert_eq!(calls, 0);
    }

    #[test]
    fn events_carry_correlation_id() {
        let sink = Arc::new(MemorySink::new());
        let mut ctl = controller(1, 1, sink.clone());
        let cid = CorrelationId::from_str_id("corr-9");
        let _: Result<(), _> = ctl.execute(&cid, &CancelToken::new(), || {
            Err(ProviderError::Timeout("slow".into()))
        });
        let events = sink.events();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.correlation_id() == &cid));
    }
}
