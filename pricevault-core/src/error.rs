//! Provider-facing error taxonomy.
//!
//! These are designed to be displayable in CLI output and carried inside
//! job results, so every variant has a stable, human-readable message.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::domain::ProviderKind;

/// Failure of a provider call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited by provider (resets at {reset_at})")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("symbol not found: {symbol}")]
    NotFound { symbol: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("response format changed: {0}")]
    Malformed(String),
}

/// How the retry wrapper and circuit breaker treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transport, timeout, 5xx: retried with backoff, counted by the breaker.
    Transient,
    /// Wait for the advertised reset; never counted by the breaker.
    RateLimited,
    /// Session expired or credentials rejected; handled by re-authentication.
    Authentication,
    /// Not found or malformed: retrying cannot help.
    Permanent,
}

impl ProviderError {
    pub fn class(&self) -> FailureClass {
        match self {
            ProviderError::Transport(_)
            | ProviderError::Timeout(_)
            | ProviderError::Server { .. } => FailureClass::Transient,
            ProviderError::RateLimited { .. } => FailureClass::RateLimited,
            ProviderError::Authentication(_) => FailureClass::Authentication,
            ProviderError::NotFound { .. } | ProviderError::Malformed(_) => FailureClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Only provider-health failures move the circuit breaker.
    pub fn counts_toward_circuit(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Raised locally when a provider's circuit is open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open for provider '{provider}' (retry in {}s)", .retry_in.as_secs())]
pub struct CircuitOpenError {
    pub provider: ProviderKind,
    pub retry_in: Duration,
}
