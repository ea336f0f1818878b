//! Bounded retry with exponential backoff and jitter.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::error::{FailureClass, ProviderError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to every delay (0.25 = ±25%).
    pub jitter: f64,
    /// Longest wait accepted for a rate-limit reset before giving up.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
            max_rate_limit_wait: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `min(base * 2^attempt, max_delay)` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn backoff(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.max_delay);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        capped.mul_f64(factor)
    }

    /// Delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` is zero-based: the first failed call is attempt 0.
    pub fn next_delay(
        &self,
        attempt: u32,
        err: &ProviderError,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        match (err.class(), err) {
            (FailureClass::Transient, _) => Some(self.backoff(attempt, rng)),
            (FailureClass::RateLimited, ProviderError::RateLimited { reset_at }) => {
                let wait = (*reset_at - now).to_std().unwrap_or(Duration::ZERO);
                (wait <= self.max_rate_limit_wait).then_some(wait)
            }
            _ => None,
        }
    }
}
