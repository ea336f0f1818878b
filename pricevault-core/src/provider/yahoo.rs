//! Yahoo Finance data provider.
//!
//! Fetches OHLCV bars from Yahoo's v8 chart API. The API requires a session
//! cookie plus a "crumb" token obtained from a handshake; both are refreshed by
//! `authenticate`. The chart JSON is flattened into a [`RawTable`].
//!
//! Yahoo Finance has no official API and is subject to unannounced format changes.

use chrono::{NaiveTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use super::payload::{PayloadBody, RawCell, RawPayload, RawTable};
use super::rate::RateWindow;
use super::transport::{encode_query, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use super::{Credentials, FetchRequest, ProviderAdapter, RateLimitInfo};
use crate::domain::{Instrument, InstrumentClass, Period, ProviderKind};
use crate::error::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";
pub const DEFAULT_COOKIE_URL: &str = "https://fc.yahoo.com";

/// Columns of the flattened chart table.
pub const COLUMNS: [&str; 7] = ["timestamp", "open", "high", "low", "close", "volume", "adjclose"];

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YahooConfig {
    pub base_url: String,
    pub cookie_url: String,
    pub timeout: Duration,
    /// Requests allowed per window before failing fast.
    pub requests_per_window: u32,
    pub window: Duration,
}

impl Default for YahooConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            cookie_url: DEFAULT_COOKIE_URL.to_string(),
            timeout: Duration::from_secs(30),
            requests_per_window: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Yahoo Finance data provider.
pub struct YahooAdapter {
    config: YahooConfig,
    transport: Box<dyn HttpTransport>,
    crumb: Option<String>,
    window: RateWindow,
}

impl YahooAdapter {
    pub fn new(config: YahooConfig) -> Result<Self, ProviderError> {
        let transport = ReqwestTransport::new(config.timeout)?;
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    pub fn with_transport(config: YahooConfig, transport: Box<dyn HttpTransport>) -> Self {
        let window = RateWindow::rolling(config.requests_per_window, config.window);
        Self {
            config,
            transport,
            crumb: None,
            window,
        }
    }

    pub fn has_crumb(&self) -> bool {
        self.crumb.is_some()
    }

    pub fn wire_symbol(instrument: &Instrument) -> String {
        match instrument.class() {
            InstrumentClass::Future { .. } => format!("{}=F", instrument.symbol()),
            InstrumentClass::Stock => instrument.symbol().to_string(),
            InstrumentClass::ForexPair { base, quote } => format!("{base}{quote}=X"),
        }
    }

    fn interval(period: Period) -> &'static str {
        match period {
            Period::Minute1 => "1m",
            Period::Minute5 => "5m",
            Period::Minute15 => "15m",
            Period::Minute30 => "30m",
            Period::Hour1 => "60m",
            Period::Daily => "1d",
            Period::Weekly => "1wk",
            Period::Monthly => "1mo",
        }
    }

    /// Build the chart API URL for a request.
    fn chart_url(&self, request: &FetchRequest<'_>, crumb: &str) -> String {
        let start_ts = request.range.start().and_time(NaiveTime::MIN).and_utc().timestamp();
        let end_ts = request.range.end().and_time(NaiveTime::MIN).and_utc().timestamp();
        format!(
            "{}/v8/finance/chart/{}\
             ?period1={start_ts}&period2={end_ts}&interval={}\
             &includeAdjustedClose=true&events=div%2Csplits&crumb={}",
            self.config.base_url,
            encode_query(&Self::wire_symbol(request.instrument)),
            Self::interval(request.period),
            encode_query(crumb),
        )
    }

    fn check_status(&mut self, resp: &HttpResponse, symbol: &str) -> Result<(), ProviderError> {
        match resp.status {
            s if (200..300).contains(&s) => Ok(()),
            // A stale crumb or cookie is answered with 401/403.
            401 | 403 => {
                self.crumb = None;
                Err(ProviderError::Authentication(format!(
                    "crumb rejected (HTTP {})",
                    resp.status
                )))
            }
            404 => Err(ProviderError::NotFound {
                symbol: symbol.to_string(),
            }),
            429 => {
                let wait = resp.retry_after().unwrap_or(60) as i64;
                let reset_at = Utc::now() + chrono::Duration::seconds(wait);
                self.window.exhaust_until(reset_at);
                Err(ProviderError::RateLimited { reset_at })
            }
            s => Err(ProviderError::Server {
                status: s,
                message: format!("HTTP {s} for {symbol}"),
            }),
        }
    }
}

/// Flatten the chart API response into a table.
fn parse_response(symbol: &str, resp: ChartResponse) -> Result<RawTable, ProviderError> {
    let mut table = RawTable::new(&COLUMNS);

    let result = match resp.chart.result {
        Some(result) => result,
        None => {
            return Err(match resp.chart.error {
                Some(err) if err.code == "Not Found" => ProviderError::NotFound {
                    symbol: symbol.to_string(),
                },
                Some(err) => ProviderError::Malformed(format!("{}: {}", err.code, err.description)),
                None => ProviderError::Malformed("empty result with no error".into()),
            })
        }
    };

    let data = result
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("result array is empty".into()))?;

    // No timestamps: the range holds no bars.
    let Some(timestamps) = data.timestamp else {
        return Ok(table);
    };

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("no quote data".into()))?;

    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    for (i, &ts) in timestamps.iter().enumerate() {
        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();
        let adj_close = adj_closes
            .as_ref()
            .and_then(|v| v.get(i).copied().flatten());

        // Skip bars where all OHLCV are None (holidays/non-trading days)
        if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none()
        {
            continue;
        }

        table.push(vec![
            RawCell::Number(ts as f64),
            open.into(),
            high.into(),
            low.into(),
            close.into(),
            volume.into(),
            adj_close.into(),
        ]);
    }

    Ok(table)
}

impl ProviderAdapter for YahooAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Yahoo
    }

    /// Cookie + crumb handshake. Yahoo takes no credentials.
    fn authenticate(&mut self, _credentials: &Credentials) -> Result<bool, ProviderError> {
        self.crumb = None;
        // The cookie endpoint answers 404 but still sets the session cookie.
        self.transport
            .send(&HttpRequest::get(&self.config.cookie_url))?;

        let url = format!("{}/v1/test/getcrumb", self.config.base_url);
        let resp = self.transport.send(&HttpRequest::get(url))?;
        match resp.status {
            200..=299 => {}
            401 | 403 => return Ok(false),
            429 => {
                return Err(ProviderError::RateLimited {
                    reset_at: Utc::now()
                        + chrono::Duration::seconds(resp.retry_after().unwrap_or(60) as i64),
                })
            }
            status => {
                return Err(ProviderError::Server {
                    status,
                    message: "crumb endpoint failed".into(),
                })
            }
        }

        let crumb = resp.text().trim().to_string();
        if crumb.is_empty() || crumb.contains('<') {
            return Ok(false);
        }
        tracing::debug!(provider = "yahoo", "crumb acquired");
        self.crumb = Some(crumb);
        Ok(true)
    }

    fn fetch_raw(&mut self, request: &FetchRequest<'_>) -> Result<RawPayload, ProviderError> {
        let Some(crumb) = self.crumb.clone() else {
            return Err(ProviderError::Authentication("no crumb; handshake required".into()));
        };
        let now = Utc::now();
        self.window.check(now)?;

        let symbol = request.instrument.symbol();
        let url = self.chart_url(request, &crumb);
        tracing::debug!(provider = "yahoo", symbol, range = %request.range, "fetching chart");

        let resp = self.transport.send(&HttpRequest::get(url))?;
        self.window.record(now);

        // Yahoo reports unknown symbols as 404 with a JSON error body.
        if resp.status == 404 {
            if let Ok(chart) = serde_json::from_slice::<ChartResponse>(&resp.body) {
                return parse_response(symbol, chart)
                    .map(|table| RawPayload::new(ProviderKind::Yahoo, symbol, PayloadBody::Table(table)));
            }
        }
        self.check_status(&resp, symbol)?;

        let chart: ChartResponse = serde_json::from_slice(&resp.body).map_err(|e| {
            ProviderError::Malformed(format!("failed to parse response for {symbol}: {e}"))
        })?;
        let table = parse_response(symbol, chart)?;
        Ok(RawPayload::new(ProviderKind::Yahoo, symbol, PayloadBody::Table(table)))
    }

    fn rate_limit_info(&mut self) -> RateLimitInfo {
        self.window.info(Utc::now())
    }
}
