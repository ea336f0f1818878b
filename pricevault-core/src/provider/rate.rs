use chrono::{DateTime, Duration, Utc};

use super::RateLimitInfo;
use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reset {
    /// Window opens on first use and lasts this long.
    Rolling(Duration),
    /// Window ends at the next UTC midnight.
    Daily,
}

/// Fixed-window request counter, checked before each provider call.
#[derive(Debug, Clone)]
pub struct RateWindow {
    limit: u32,
    used: u32,
    reset: Reset,
    reset_at: Option<DateTime<Utc>>,
}

impl RateWindow {
    pub fn rolling(limit: u32, window: std::time::Duration) -> Self {
        let window = Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(60));
        Self {
            limit,
            used: 0,
            reset: Reset::Rolling(window),
            reset_at: None,
        }
    }

    pub fn daily(limit: u32) -> Self {
        Self {
            limit,
            used: 0,
            reset: Reset::Daily,
            reset_at: None,
        }
    }

    /// Fail fast when the window is exhausted.
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<(), ProviderError> {
        self.roll(now);
        match self.reset_at {
            Some(reset_at) if self.used >= self.limit => Err(ProviderError::RateLimited { reset_at }),
            _ => Ok(()),
        }
    }

    pub fn record(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        if self.reset_at.is_none() {
            self.reset_at = Some(self.next_reset(now));
        }
        self.used = self.used.saturating_add(1);
    }

    /// The provider told us we are out of budget until `reset_at`.
    pub fn exhaust_until(&mut self, reset_at: DateTime<Utc>) {
        self.used = self.limit;
        self.reset_at = Some(reset_at);
    }

    pub fn info(&mut self, now: DateTime<Utc>) -> RateLimitInfo {
        self.roll(now);
        RateLimitInfo {
            remaining: Some(self.limit.saturating_sub(self.used)),
            reset_at: self.reset_at,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if matches!(self.reset_at, Some(at) if now >= at) {
            self.used = 0;
            self.reset_at = None;
        }
    }

    fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.reset {
            Reset::Rolling(window) => now + window,
            Reset::Daily => {
                let tomorrow = now.date_naive() + Duration::days(1);
                tomorrow
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or(now + Duration::days(1))
            }
        }
    }
}
