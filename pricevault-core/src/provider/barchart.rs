//! Barchart-style web session provider.
//!
//! Login is a form POST guarded by a CSRF token scraped from the login page;
//! the session cookie is kept by the transport. History comes back from the
//! `queryeod` endpoint as headerless CSV, one row per bar. Accounts get a
//! fixed number of downloads per UTC day.

use chrono::Utc;
use std::time::Duration;

use super::payload::{PayloadBody, RawPayload};
use super::rate::RateWindow;
use super::transport::{encode_query, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use super::{Credentials, FetchRequest, ProviderAdapter, RateLimitInfo};
use crate::domain::{Instrument, InstrumentClass, Period, ProviderKind};
use crate::error::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://www.barchart.com";
pub const DEFAULT_DAILY_ALLOWANCE: u32 = 100;

/// Header prepended to end-of-day rows.
const EOD_HEADER: &str = "symbol,tradingDay,open,high,low,close,volume,openInterest";
/// Header prepended to intraday rows.
const INTRADAY_HEADER: &str = "timestamp,tradingDay,open,high,low,close,volume";

#[derive(Debug, Clone, PartialEq)]
pub struct BarchartConfig {
    pub base_url: String,
    pub daily_allowance: u32,
    pub timeout: Duration,
}

impl Default for BarchartConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            daily_allowance: DEFAULT_DAILY_ALLOWANCE,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct BarchartAdapter {
    config: BarchartConfig,
    transport: Box<dyn HttpTransport>,
    csrf_token: Option<String>,
    allowance: RateWindow,
}

impl BarchartAdapter {
    pub fn new(config: BarchartConfig) -> Result<Self, ProviderError> {
        let transport = ReqwestTransport::new(config.timeout)?;
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    pub fn with_transport(config: BarchartConfig, transport: Box<dyn HttpTransport>) -> Self {
        let allowance = RateWindow::daily(config.daily_allowance);
        Self {
            config,
            transport,
            csrf_token: None,
            allowance,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.csrf_token.is_some()
    }

    /// Symbol as the history endpoint expects it.
    pub fn wire_symbol(instrument: &Instrument) -> String {
        match instrument.class() {
            // Nearest contract of the root.
            InstrumentClass::Future { .. } => format!("{}*0", instrument.symbol()),
            InstrumentClass::Stock => instrument.symbol().to_string(),
            InstrumentClass::ForexPair { base, quote } => format!("^{base}{quote}"),
        }
    }

    fn history_url(&self, request: &FetchRequest<'_>) -> String {
        let (data, interval) = match request.period {
            Period::Minute1 => ("minutes", 1),
            Period::Minute5 => ("minutes", 5),
            Period::Minute15 => ("minutes", 15),
            Period::Minute30 => ("minutes", 30),
            Period::Hour1 => ("minutes", 60),
            Period::Daily => ("daily", 1),
            Period::Weekly => ("weekly", 1),
            Period::Monthly => ("monthly", 1),
        };
        format!(
            "{}/proxies/timeseries/queryeod.ashx?symbol={}&data={data}&interval={interval}\
             &start={}&end={}&volume=contract&order=asc&dividends=false&backadjust=false\
             &daystoexpiration=1&contractroll=expiration",
            self.config.base_url,
            encode_query(&Self::wire_symbol(request.instrument)),
            request.range.start().format("%Y%m%d"),
            request.range.last_day().format("%Y%m%d"),
        )
    }

    fn check_status(&mut self, resp: &HttpResponse, symbol: &str) -> Result<(), ProviderError> {
        match resp.status {
            s if (200..300).contains(&s) => Ok(()),
            401 | 403 => {
                self.csrf_token = None;
                Err(ProviderError::Authentication(format!(
                    "session rejected (HTTP {})",
                    resp.status
                )))
            }
            404 => Err(ProviderError::NotFound {
                symbol: symbol.to_string(),
            }),
            429 => {
                let wait = resp.retry_after().unwrap_or(60) as i64;
                let reset_at = Utc::now() + chrono::Duration::seconds(wait);
                self.allowance.exhaust_until(reset_at);
                Err(ProviderError::RateLimited { reset_at })
            }
            s => Err(ProviderError::Server {
                status: s,
                message: truncate(&resp.text(), 200),
            }),
        }
    }
}

impl ProviderAdapter for BarchartAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Barchart
    }

    fn authenticate(&mut self, credentials: &Credentials) -> Result<bool, ProviderError> {
        let (Some(username), Some(password)) = (&credentials.username, &credentials.password)
        else {
            return Err(ProviderError::Authentication(
                "username and password are required".into(),
            ));
        };
        self.csrf_token = None;

        let login_url = format!("{}/login", self.config.base_url);
        let page = self.transport.send(&HttpRequest::get(&login_url))?;
        if !page.is_success() {
            return Err(ProviderError::Server {
                status: page.status,
                message: "login page unavailable".into(),
            });
        }
        let token = extract_csrf_token(&page.text())
            .ok_or_else(|| ProviderError::Malformed("login page has no CSRF token".into()))?;

        let form = vec![
            ("_token".to_string(), token.clone()),
            ("email".to_string(), username.clone()),
            ("password".to_string(), password.clone()),
            ("remember".to_string(), "1".to_string()),
        ];
        let resp = self
            .transport
            .send(&HttpRequest::post_form(&login_url, form).header("x-csrf-token", &token))?;

        match resp.status {
            200..=399 => {
                tracing::debug!(provider = "barchart", "login accepted");
                self.csrf_token = Some(token);
                Ok(true)
            }
            401 | 403 | 419 | 422 => {
                tracing::warn!(provider = "barchart", status = resp.status, "login rejected");
                Ok(false)
            }
            status => Err(ProviderError::Server {
                status,
                message: "login failed".into(),
            }),
        }
    }

    fn fetch_raw(&mut self, request: &FetchRequest<'_>) -> Result<RawPayload, ProviderError> {
        let Some(token) = self.csrf_token.clone() else {
            return Err(ProviderError::Authentication("not logged in".into()));
        };
        let now = Utc::now();
        self.allowance.check(now)?;

        let symbol = request.instrument.symbol();
        let url = self.history_url(request);
        tracing::debug!(
            provider = "barchart",
            symbol,
            range = %request.range,
            period = %request.period,
            "fetching history"
        );

        let resp = self.transport.send(
            &HttpRequest::get(url)
                .header("x-xsrf-token", &token)
                .header("referer", &self.config.base_url),
        )?;
        self.check_status(&resp, symbol)?;
        self.allowance.record(now);

        let text = resp.text();
        let trimmed = text.trim_start();
        // An expired session is answered with the HTML login page instead of CSV.
        if trimmed.starts_with('<') {
            self.csrf_token = None;
            return Err(ProviderError::Authentication("session expired".into()));
        }

        let header = if request.period.is_intraday() {
            INTRADAY_HEADER
        } else {
            EOD_HEADER
        };
        let mut csv = Vec::with_capacity(header.len() + 1 + trimmed.len());
        csv.extend_from_slice(header.as_bytes());
        csv.push(b'\n');
        csv.extend_from_slice(trimmed.as_bytes());

        Ok(RawPayload::new(ProviderKind::Barchart, symbol, PayloadBody::Csv(csv)))
    }

    fn rate_limit_info(&mut self) -> RateLimitInfo {
        self.allowance.info(Utc::now())
    }
}

/// Pull the token out of `<meta name="csrf-token" content="...">`.
fn extract_csrf_token(html: &str) -> Option<String> {
    let at = html.find("name=\"csrf-token\"")?;
    let tag_start = html[..at].rfind('<')?;
    let tag_end = at + html[at..].find('>')?;
    let tag = &html[tag_start..tag_end];
    let content = tag.find("content=\"")? + "content=\"".len();
    let len = tag[content..].find('"')?;
    let token = &tag[content..content + len];
    (!token.is_empty()).then(|| token.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
