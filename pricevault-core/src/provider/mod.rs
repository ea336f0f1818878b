//! Provider adapters.
//!
//! Every external source sits behind the same capability contract
//! ([`ProviderAdapter`]): authenticate, fetch a raw payload for one
//! instrument/period/range, and report rate-limit state. Transport details
//! (HTTP sessions, CSRF tokens, crumbs, gateway frames) never leak past it.
//! The set of sources is closed, so dispatch goes through the [`Provider`] enum.

pub mod barchart;
pub mod gateway;
pub mod payload;
pub mod rate;
pub mod transport;
pub mod yahoo;

pub use barchart::{BarchartAdapter, BarchartConfig};
pub use gateway::{GatewayAdapter, GatewayConfig};
pub use payload::{PayloadBody, RawCell, RawPayload, RawTable};
pub use rate::RateWindow;
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, ScriptedTransport,
    TransportFailure,
};
pub use yahoo::{YahooAdapter, YahooConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{DateRange, Instrument, Period, ProviderKind};
use crate::error::ProviderError;

/// Secrets for one provider. Never logged: `Debug` redacts everything.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<i32>,
}

impl Credentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn login(username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            client_id: None,
        }
    }

    pub fn client(client_id: i32) -> Self {
        Self {
            client_id: Some(client_id),
            ..Self::default()
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |set: bool| if set { "<redacted>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("username", &redact(self.username.is_some()))
            .field("password", &redact(self.password.is_some()))
            .field("client_id", &redact(self.client_id.is_some()))
            .finish()
    }
}

/// One fetch: an instrument at one period over one date range.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub instrument: &'a Instrument,
    pub period: Period,
    pub range: DateRange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Capability contract shared by all sources.
///
/// Calls are blocking; each adapter is owned by exactly one worker lane.
pub trait ProviderAdapter: Send {
    fn kind(&self) -> ProviderKind;

    /// Establish (or re-establish) a session. Idempotent.
    ///
    /// `Ok(false)` means the provider rejected the credentials.
    fn authenticate(&mut self, credentials: &Credentials) -> Result<bool, ProviderError>;

    fn fetch_raw(&mut self, request: &FetchRequest<'_>) -> Result<RawPayload, ProviderError>;

    fn rate_limit_info(&mut self) -> RateLimitInfo;
}

pub enum Provider {
    Barchart(BarchartAdapter),
    Yahoo(YahooAdapter),
    Gateway(GatewayAdapter),
}

impl Provider {
    fn inner(&mut self) -> &mut dyn ProviderAdapter {
        match self {
            Provider::Barchart(a) => a,
            Provider::Yahoo(a) => a,
            Provider::Gateway(a) => a,
        }
    }
}

impl ProviderAdapter for Provider {
    fn kind(&self) -> ProviderKind {
        match self {
            Provider::Barchart(_) => ProviderKind::Barchart,
            Provider::Yahoo(_) => ProviderKind::Yahoo,
            Provider::Gateway(_) => ProviderKind::Gateway,
        }
    }

    fn authenticate(&mut self, credentials: &Credentials) -> Result<bool, ProviderError> {
        self.inner().authenticate(credentials)
    }

    fn fetch_raw(&mut self, request: &FetchRequest<'_>) -> Result<RawPayload, ProviderError> {
        self.inner().fetch_raw(request)
    }

    fn rate_limit_info(&mut self) -> RateLimitInfo {
        self.inner().rate_limit_info()
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Provider").field(&self.kind()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::login("trader@example.com", "hunter2");
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("trader@example.com"));
        assert!(dbg.contains("<redacted>"));
    }
}
