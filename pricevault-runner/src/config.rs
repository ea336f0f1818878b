//! Run configuration, loaded from TOML.
//!
//! ```toml
//! output_root = "data"
//!
//! [storage]
//! provider_priority = ["barchart", "gateway", "yahoo"]
//!
//! [[instruments]]
//! symbol = "GC"
//! type = "future"
//! cycle = "GJMQVZ"
//! first_date = "1975-01-02"
//! periods = ["1d"]
//!
//! [[downloads]]
//! symbol = "GC"
//! provider = "barchart"
//! start = "2020-01-01"
//! end = "2024-01-01"
//! ```
//!
//! Date ranges are half-open: `end` is the first day *not* downloaded. A
//! missing `end` means "through today".

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use pricevault_core::domain::{parse_forex_code, DateRange, DomainError, Instrument, Period, ProviderKind};
use pricevault_core::provider::{
    barchart, yahoo, BarchartConfig, GatewayConfig, YahooConfig,
};
use pricevault_core::resilience::{
    BreakerConfig, RetryPolicy, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT,
};
use pricevault_core::storage::{StorageBridge, DEFAULT_MIN_ROWS};
use pricevault_core::transform::QualityPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(String),

    #[error("instrument '{symbol}': {source}")]
    Instrument {
        symbol: String,
        #[source]
        source: DomainError,
    },

    #[error("instrument '{0}' is defined more than once")]
    DuplicateInstrument(String),

    #[error("download references unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("download of '{symbol}': start {start} must be before end {end}")]
    InvalidRange {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    },

    #[error("download of '{symbol}' asks for period {period}, which the instrument does not offer")]
    PeriodNotOffered { symbol: String, period: Period },

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Default root for all datasets.
    pub output_root: PathBuf,

    /// Worker threads for provider lanes. Defaults to the number of providers in the run.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Fixes retry jitter for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub quality: QualityPolicy,

    #[serde(default)]
    pub resilience: ResilienceSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub providers: ProviderSettings,

    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,

    #[serde(default)]
    pub downloads: Vec<DownloadSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub max_rate_limit_wait_secs: u64,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_secs: DEFAULT_RESET_TIMEOUT.as_secs(),
            max_retries: retry.max_retries,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            jitter: retry.jitter,
            max_rate_limit_wait_secs: retry.max_rate_limit_wait.as_secs(),
        }
    }
}

impl ResilienceSettings {
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            max_rate_limit_wait: Duration::from_secs(self.max_rate_limit_wait_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    /// Most trusted first. Providers not listed rank below all listed ones.
    pub provider_priority: Vec<ProviderKind>,
    pub min_rows: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            provider_priority: ProviderKind::ALL.to_vec(),
            min_rows: DEFAULT_MIN_ROWS,
        }
    }
}

impl StorageSettings {
    pub fn bridge(&self) -> StorageBridge {
        StorageBridge::new(self.provider_priority.clone(), self.min_rows)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub barchart: BarchartSettings,
    pub yahoo: YahooSettings,
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BarchartSettings {
    pub base_url: String,
    pub daily_allowance: u32,
    pub timeout_secs: u64,
}

impl Default for BarchartSettings {
    fn default() -> Self {
        Self {
            base_url: barchart::DEFAULT_BASE_URL.to_string(),
            daily_allowance: barchart::DEFAULT_DAILY_ALLOWANCE,
            timeout_secs: 30,
        }
    }
}

impl BarchartSettings {
    pub fn adapter_config(&self) -> BarchartConfig {
        BarchartConfig {
            base_url: self.base_url.clone(),
            daily_allowance: self.daily_allowance,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct YahooSettings {
    pub base_url: String,
    pub cookie_url: String,
    pub timeout_secs: u64,
    pub requests_per_minute: u32,
}

impl Default for YahooSettings {
    fn default() -> Self {
        Self {
            base_url: yahoo::DEFAULT_BASE_URL.to_string(),
            cookie_url: yahoo::DEFAULT_COOKIE_URL.to_string(),
            timeout_secs: 30,
            requests_per_minute: 60,
        }
    }
}

impl YahooSettings {
    pub fn adapter_config(&self) -> YahooConfig {
        YahooConfig {
            base_url: self.base_url.clone(),
            cookie_url: self.cookie_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            requests_per_window: self.requests_per_minute,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub pacing_limit: u32,
    pub pacing_window_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let d = GatewayConfig::default();
        Self {
            host: d.host,
            port: d.port,
            client_id: d.client_id,
            connect_timeout_secs: d.connect_timeout.as_secs(),
            read_timeout_secs: d.read_timeout.as_secs(),
            pacing_limit: d.pacing_limit,
            pacing_window_secs: d.pacing_window.as_secs(),
        }
    }
}

impl GatewaySettings {
    pub fn adapter_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            pacing_limit: self.pacing_limit,
            pacing_window: Duration::from_secs(self.pacing_window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Future,
    Stock,
    Forex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentSpec {
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: InstrumentType,
    /// Futures only: active contract months, e.g. `GJMQVZ`.
    #[serde(default)]
    pub cycle: Option<String>,
    pub first_date: NaiveDate,
    #[serde(default)]
    pub periods: Option<Vec<Period>>,
}

impl InstrumentSpec {
    pub fn build(&self) -> Result<Instrument, ConfigError> {
        let periods = self.periods.as_deref();
        let built = match self.kind {
            InstrumentType::Future => {
                Instrument::future(&self.symbol, self.cycle.as_deref(), self.first_date, periods)
            }
            InstrumentType::Stock => Instrument::stock(&self.symbol, self.first_date, periods),
            InstrumentType::Forex => Instrument::forex(&self.symbol, self.first_date, periods),
        };
        built.map_err(|source| ConfigError::Instrument {
            symbol: self.symbol.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSpec {
    pub symbol: String,
    pub provider: ProviderKind,
    pub start: NaiveDate,
    /// Exclusive. Defaults to tomorrow, so today is included.
    #[serde(default)]
    pub end: Option<NaiveDate>,
    /// Defaults to every period the instrument offers.
    #[serde(default)]
    pub periods: Option<Vec<Period>>,
    #[serde(default)]
    pub output_root: Option<PathBuf>,
}

/// A download spec resolved against its instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub instrument: Arc<Instrument>,
    pub provider: ProviderKind,
    pub range: DateRange,
    pub periods: Vec<Period>,
    pub output_root: PathBuf,
}

impl RunConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RunConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check settings, instrument definitions and every download reference.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::InvalidSetting("workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.quality.min_quality) {
            return Err(ConfigError::InvalidSetting(format!(
                "quality.min_quality must be within [0, 1], got {}",
                self.quality.min_quality
            )));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(ConfigError::InvalidSetting(
                "resilience.failure_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.resilience.jitter) {
            return Err(ConfigError::InvalidSetting(format!(
                "resilience.jitter must be within [0, 1], got {}",
                self.resilience.jitter
            )));
        }
        self.requests().map(|_| ())
    }

    pub fn instruments(&self) -> Result<Vec<Arc<Instrument>>, ConfigError> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.instruments.len());
        for spec in &self.instruments {
            let instrument = spec.build()?;
            if !seen.insert(instrument.symbol().to_string()) {
                return Err(ConfigError::DuplicateInstrument(instrument.symbol().to_string()));
            }
            out.push(Arc::new(instrument));
        }
        Ok(out)
    }

    /// Resolve every download against its instrument, in file order.
    pub fn requests(&self) -> Result<Vec<DownloadRequest>, ConfigError> {
        let today = Utc::now().date_naive();
        self.requests_as_of(today)
    }

    pub fn requests_as_of(&self, today: NaiveDate) -> Result<Vec<DownloadRequest>, ConfigError> {
        let instruments = self.instruments()?;
        let default_end = today.succ_opt().unwrap_or(today);

        self.downloads
            .iter()
            .map(|spec| {
                let instrument = instruments
                    .iter()
                    .find(|i| refers_to(i, &spec.symbol))
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownInstrument(spec.symbol.clone()))?;

                let end = spec.end.unwrap_or(default_end);
                let range = DateRange::new(spec.start, end).map_err(|_| ConfigError::InvalidRange {
                    symbol: spec.symbol.clone(),
                    start: spec.start,
                    end,
                })?;

                let periods = match &spec.periods {
                    Some(list) if !list.is_empty() => Period::normalize_list(Some(list.as_slice())),
                    _ => instrument.periods().to_vec(),
                };
                if let Some(period) = periods.iter().find(|p| !instrument.supports(**p)) {
                    return Err(ConfigError::PeriodNotOffered {
                        symbol: instrument.symbol().to_string(),
                        period: *period,
                    });
                }

                Ok(DownloadRequest {
                    instrument,
                    provider: spec.provider,
                    range,
                    periods,
                    output_root: spec
                        .output_root
                        .clone()
                        .unwrap_or_else(|| self.output_root.clone()),
                })
            })
            .collect()
    }
}

/// True if a download symbol names this instrument, in any accepted spelling.
fn refers_to(instrument: &Instrument, symbol: &str) -> bool {
    if instrument.symbol().eq_ignore_ascii_case(symbol.trim()) {
        return true;
    }
    match (instrument.currencies(), parse_forex_code(symbol)) {
        (Some((base, quote)), Ok((b, q))) => base == b && quote == q,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
output_root = "data"
seed = 7

[resilience]
failure_threshold = 3
max_retries = 1

[storage]
provider_priority = ["barchart", "yahoo"]
min_rows = 2

[providers.gateway]
port = 7497
client_id = 12

[[instruments]]
symbol = "GC"
type = "future"
cycle = "GJMQVZ"
first_date = "1975-01-02"
periods = ["1d", "1h"]

[[instruments]]
symbol = "EUR/USD"
type = "forex"
first_date = "2003-12-01"

[[downloads]]
symbol = "GC"
provider = "barchart"
start = "2020-01-01"
end = "2024-01-01"

[[downloads]]
symbol = "EURUSD=X"
provider = "yahoo"
start = "2023-01-01"
end = "2023-06-01"
output_root = "fx"
"#;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_sample_config() {
        let config = RunConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.resilience.failure_threshold, 3);
        // Unspecified settings keep their defaults.
        assert_eq!(config.resilience.reset_timeout_secs, 60);
        assert_eq!(config.providers.gateway.port, 7497);
        assert_eq!(config.providers.gateway.host, "127.0.0.1");
        assert_eq!(config.storage.bridge().min_rows(), 2);

        let requests = config.requests().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].periods, vec![Period::Hour1, Period::Daily]);
        assert_eq!(requests[0].range, DateRange::new(d(2020, 1, 1), d(2024, 1, 1)).unwrap());
        assert_eq!(requests[1].instrument.symbol(), "EURUSD");
        assert_eq!(requests[1].periods, vec![Period::Daily]);
        assert_eq!(requests[1].output_root, PathBuf::from("fx"));
    }

    #[test]
    fn missing_end_runs_through_today() {
        let mut config = RunConfig::from_toml(SAMPLE).unwrap();
        config.downloads[0].end = None;
        let requests = config.requests_as_of(d(2024, 3, 15)).unwrap();
        assert_eq!(requests[0].range.end(), d(2024, 3, 16));
    }

    #[test]
    fn unknown_instrument_is_rejected() {
        let toml = SAMPLE.replace("symbol = \"GC\"\nprovider", "symbol = \"SI\"\nprovider");
        assert!(matches!(
            RunConfig::from_toml(&toml),
            Err(ConfigError::UnknownInstrument(s)) if s == "SI"
        ));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let toml = SAMPLE.replace("end = \"2024-01-01\"", "end = \"2019-01-01\"");
        assert!(matches!(
            RunConfig::from_toml(&toml),
            Err(ConfigError::InvalidRange { .. })
        ));
    }

    #[test]
    fn period_must_be_offered_by_instrument() {
        let toml = SAMPLE.replace(
            "end = \"2024-01-01\"\n",
            "end = \"2024-01-01\"\nperiods = [\"5m\"]\n",
        );
        assert!(matches!(
            RunConfig::from_toml(&toml),
            Err(ConfigError::PeriodNotOffered { period: Period::Minute5, .. })
        ));
    }

    #[test]
    fn bad_settings_are_rejected() {
        let toml = SAMPLE.replace("seed = 7", "seed = 7\nworkers = 0");
        assert!(matches!(
            RunConfig::from_toml(&toml),
            Err(ConfigError::InvalidSetting(_))
        ));
        let toml = SAMPLE.replace("max_retries = 1", "max_retries = 1\njitter = 1.5");
        assert!(matches!(
            RunConfig::from_toml(&toml),
            Err(ConfigError::InvalidSetting(_))
        ));
    }

    #[test]
    fn duplicate_instrument_is_rejected() {
        let toml = SAMPLE.replace("symbol = \"EUR/USD\"\ntype = \"forex\"", "symbol = \"GC\"\ntype = \"stock\"");
        assert!(matches!(
            RunConfig::from_toml(&toml),
            Err(ConfigError::DuplicateInstrument(s)) if s == "GC"
        ));
    }

    #[test]
    fn config_survives_toml_round_trip() {
        let config = RunConfig::from_toml(SAMPLE).unwrap();
        let again = RunConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(config, again);
    }
}
