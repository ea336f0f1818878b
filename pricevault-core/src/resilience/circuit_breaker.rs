//! Per-provider circuit breaker.
//!
//! Three states:
//! - **Closed**: calls go through; consecutive failures are counted.
//! - **Open**: calls are refused until `reset_timeout` has elapsed since the last failure.
//! - **HalfOpen**: exactly one trial call is allowed; its outcome closes or re-opens the circuit.
//!
//! One breaker belongs to one provider lane, so all methods take `&mut self`
//! and no locking is involved.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::domain::ProviderKind;
use crate::error::{CircuitOpenError, ProviderError};

/// Default number of consecutive failures before the circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cooldown before an open circuit admits a trial call.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change, reported so the owner can emit an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

/// Outcome of a guarded call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Refused without running the operation.
    Open(CircuitOpenError),
    /// The operation ran and failed.
    Failed(ProviderError),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: ProviderKind,
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    transitions: Vec<Transition>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderKind, config: BreakerConfig) -> Self {
        Self {
            provider,
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_in_flight: false,
            transitions: Vec::new(),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Whether a call made now would be let through (without changing state).
    pub fn would_allow(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open => self.cooldown_elapsed(),
        }
    }

    /// Remaining cooldown (zero unless open).
    pub fn remaining_cooldown(&self) -> Duration {
        match (self.state, self.last_failure) {
            (CircuitState::Open, Some(at)) => self.config.reset_timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Rate-limit failures pass through without touching the failure count;
    /// other non-transient failures (auth, not found) are reported but do not
    /// count either, since they say nothing about provider health.
    pub fn execute<T>(
        &mut self,
        op: impl FnOnce() -> Result<T, ProviderError>,
    ) -> Result<T, CallError> {
        self.acquire().map_err(CallError::Open)?;
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.counts_toward_circuit() {
                    self.record_failure();
                } else {
                    self.record_neutral();
                }
                Err(CallError::Failed(err))
            }
        }
    }

    /// Take the transitions recorded since the last call.
    pub fn take_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    fn acquire(&mut self) -> Result<(), CircuitOpenError> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen => Err(self.open_error()),
            CircuitState::Open => {
                if self.cooldown_elapsed() {
                    self.transition(CircuitState::HalfOpen);
                    self.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
        self.trial_in_flight = false;
        if self.state == CircuitState::HalfOpen {
            self.transition(CircuitState::Closed);
            self.last_failure = None;
        }
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => self.transition(CircuitState::Open),
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.transition(CircuitState::Open)
            }
            _ => {}
        }
    }

    fn record_neutral(&mut self) {
        // A trial that ended without a verdict frees the slot for the next one.
        self.trial_in_flight = false;
    }

    fn cooldown_elapsed(&self) -> bool {
        self.last_failure
            .map_or(true, |at| at.elapsed() >= self.config.reset_timeout)
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            provider: self.provider,
            retry_in: self.remaining_cooldown(),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        if from != to {
            self.state = to;
            self.transitions.push(Transition { from, to });
        }
    }
}
