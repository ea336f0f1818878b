//! Local brokerage gateway provider.
//!
//! Speaks length-prefixed JSON frames (see [`codec`]) over a persistent TCP
//! connection. `authenticate` opens the socket and performs the hello
//! handshake; a dropped connection is re-established transparently on the
//! next fetch using the same client id. The gateway enforces a pacing window
//! on historical requests, mirrored locally so we fail fast instead of
//! collecting pacing violations.

pub mod codec;

use chrono::Utc;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use self::codec::{read_frame, write_frame, Contract, GatewayBar, GatewayMessage, PROTOCOL_VERSION};
use super::payload::{PayloadBody, RawCell, RawPayload, RawTable};
use super::rate::RateWindow;
use super::{Credentials, FetchRequest, ProviderAdapter, RateLimitInfo};
use crate::domain::{Instrument, InstrumentClass, Period, ProviderKind};
use crate::error::ProviderError;

pub const COLUMNS: [&str; 8] = ["time", "open", "high", "low", "close", "volume", "wap", "barCount"];

const CODE_PACING_VIOLATION: i32 = 162;
const CODE_NO_SECURITY: i32 = 200;
const CODES_CONNECTIVITY: [i32; 3] = [502, 504, 1100];
/// Farm status notices; not errors.
const INFO_CODES: std::ops::RangeInclusive<i32> = 2100..=2199;

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Historical requests allowed per pacing window.
    pub pacing_limit: u32,
    pub pacing_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4001,
            client_id: 1,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            pacing_limit: 60,
            pacing_window: Duration::from_secs(600),
        }
    }
}

pub struct GatewayAdapter {
    config: GatewayConfig,
    stream: Option<TcpStream>,
    /// Set after a successful handshake; used to reconnect.
    client_id: Option<i32>,
    next_req_id: u32,
    pacing: RateWindow,
}

impl GatewayAdapter {
    pub fn new(config: GatewayConfig) -> Self {
        let pacing = RateWindow::rolling(config.pacing_limit, config.pacing_window);
        Self {
            config,
            stream: None,
            client_id: None,
            next_req_id: 1,
            pacing,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn contract(instrument: &Instrument) -> (Contract, &'static str) {
        match instrument.class() {
            InstrumentClass::Future { .. } => (
                Contract {
                    symbol: instrument.symbol().to_string(),
                    sec_type: "CONTFUT".into(),
                    exchange: String::new(),
                    currency: "USD".into(),
                },
                "TRADES",
            ),
            InstrumentClass::Stock => (
                Contract {
                    symbol: instrument.symbol().to_string(),
                    sec_type: "STK".into(),
                    exchange: "SMART".into(),
                    currency: "USD".into(),
                },
                "TRADES",
            ),
            InstrumentClass::ForexPair { base, quote } => (
                Contract {
                    symbol: base.clone(),
                    sec_type: "CASH".into(),
                    exchange: "IDEALPRO".into(),
                    currency: quote.clone(),
                },
                "MIDPOINT",
            ),
        }
    }

    fn bar_size(period: Period) -> &'static str {
        match period {
            Period::Minute1 => "1 min",
            Period::Minute5 => "5 mins",
            Period::Minute15 => "15 mins",
            Period::Minute30 => "30 mins",
            Period::Hour1 => "1 hour",
            Period::Daily => "1 day",
            Period::Weekly => "1 week",
            Period::Monthly => "1 month",
        }
    }

    /// Day counts stop at 365; longer spans go in whole years when they
    /// divide evenly, else in weeks rounded up.
    fn duration(days: i64) -> String {
        if days <= 365 {
            format!("{days} D")
        } else if days % 365 == 0 {
            format!("{} Y", days / 365)
        } else {
            format!("{} W", (days + 6) / 7)
        }
    }

    fn connect(&mut self, client_id: i32) -> Result<bool, ProviderError> {
        self.stream = None;
        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(map_io)?
            .next()
            .ok_or_else(|| {
                ProviderError::Transport(format!("cannot resolve {}", self.config.host))
            })?;
        let mut stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout).map_err(map_io)?;
        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(map_io)?;
        stream
            .set_write_timeout(Some(self.config.read_timeout))
            .map_err(map_io)?;
        stream.set_nodelay(true).map_err(map_io)?;

        write_frame(
            &mut stream,
            &GatewayMessage::Hello {
                client_id,
                version: PROTOCOL_VERSION,
            },
        )
        .map_err(map_io)?;

        match read_frame(&mut stream).map_err(map_io)? {
            GatewayMessage::HelloAck { server_version } => {
                tracing::debug!(provider = "gateway", client_id, server_version, "connected");
                self.stream = Some(stream);
                self.client_id = Some(client_id);
                Ok(true)
            }
            GatewayMessage::Error { code, message, .. } => {
                tracing::warn!(provider = "gateway", code, message = message.as_str(), "handshake refused");
                Ok(false)
            }
            other => Err(ProviderError::Malformed(format!(
                "unexpected handshake reply: {other:?}"
            ))),
        }
    }

    fn ensure_connected(&mut self) -> Result<(), ProviderError> {
        if self.stream.is_some() {
            return Ok(());
        }
        match self.client_id {
            Some(client_id) => {
                if self.connect(client_id)? {
                    Ok(())
                } else {
                    Err(ProviderError::Authentication("gateway refused reconnect".into()))
                }
            }
            None => Err(ProviderError::Authentication("not connected to gateway".into())),
        }
    }

    fn request_history(
        &mut self,
        req_id: u32,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<GatewayBar>, ProviderError> {
        let (contract, what_to_show) = Self::contract(request.instrument);
        let msg = GatewayMessage::HistoricalRequest {
            req_id,
            contract,
            end: request.range.end().format("%Y%m%d-00:00:00").to_string(),
            duration: Self::duration(request.range.num_days()),
            bar_size: Self::bar_size(request.period).to_string(),
            what_to_show: what_to_show.to_string(),
            use_rth: false,
        };

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProviderError::Transport("connection lost".into()))?;
        write_frame(stream, &msg).map_err(map_io)?;

        loop {
            match read_frame(stream).map_err(map_io)? {
                GatewayMessage::HistoricalData { req_id: id, bars } if id == req_id => return Ok(bars),
                GatewayMessage::Error { req_id: id, code, message }
                    if id.map_or(true, |id| id == req_id) =>
                {
                    if INFO_CODES.contains(&code) {
                        tracing::debug!(provider = "gateway", code, message = message.as_str(), "notice");
                        continue;
                    }
                    // "HMDS query returned no data" shares the pacing code.
                    if code == CODE_PACING_VIOLATION && message.contains("returned no data") {
                        return Ok(Vec::new());
                    }
                    return Err(GatewayFailure { code, message }.into_provider_error(
                        request.instrument.symbol(),
                        self.config.pacing_window,
                    ));
                }
                // Replies to requests abandoned earlier.
                _ => continue,
            }
        }
    }
}

struct GatewayFailure {
    code: i32,
    message: String,
}

impl GatewayFailure {
    fn into_provider_error(self, symbol: &str, pacing_window: Duration) -> ProviderError {
        match self.code {
            CODE_PACING_VIOLATION => ProviderError::RateLimited {
                reset_at: Utc::now()
                    + chrono::Duration::from_std(pacing_window)
                        .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            },
            CODE_NO_SECURITY => ProviderError::NotFound {
                symbol: symbol.to_string(),
            },
            c if CODES_CONNECTIVITY.contains(&c) => {
                ProviderError::Transport(format!("gateway error {c}: {}", self.message))
            }
            c => ProviderError::Malformed(format!("gateway error {c}: {}", self.message)),
        }
    }
}

impl ProviderAdapter for GatewayAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gateway
    }

    fn authenticate(&mut self, credentials: &Credentials) -> Result<bool, ProviderError> {
        let client_id = credentials.client_id.unwrap_or(self.config.client_id);
        self.connect(client_id)
    }

    fn fetch_raw(&mut self, request: &FetchRequest<'_>) -> Result<RawPayload, ProviderError> {
        self.ensure_connected()?;
        let now = Utc::now();
        self.pacing.check(now)?;

        let req_id = self.next_req_id;
        self.next_req_id = self.next_req_id.wrapping_add(1).max(1);
        self.pacing.record(now);

        let symbol = request.instrument.symbol();
        tracing::debug!(provider = "gateway", symbol, req_id, range = %request.range, "requesting history");

        let bars = match self.request_history(req_id, request) {
            Ok(bars) => bars,
            Err(err) => {
                match &err {
                    ProviderError::RateLimited { reset_at } => self.pacing.exhaust_until(*reset_at),
                    // The frame boundary may be lost; reconnect on the next request.
                    ProviderError::Transport(_)
                    | ProviderError::Timeout(_)
                    | ProviderError::Malformed(_) => self.stream = None,
                    _ => {}
                }
                return Err(err);
            }
        };

        let is_forex = matches!(request.instrument.class(), InstrumentClass::ForexPair { .. });
        let mut table = RawTable::new(&COLUMNS);
        for bar in bars {
            // Midpoint bars carry no volume; the gateway reports -1.
            let volume = if is_forex && bar.volume < 0.0 { 0.0 } else { bar.volume };
            table.push(vec![
                RawCell::Text(bar.time),
                RawCell::Number(bar.open),
                RawCell::Number(bar.high),
                RawCell::Number(bar.low),
                RawCell::Number(bar.close),
                RawCell::Number(volume),
                bar.wap.into(),
                bar.bar_count.into(),
            ]);
        }
        Ok(RawPayload::new(ProviderKind::Gateway, symbol, PayloadBody::Table(table)))
    }

    fn rate_limit_info(&mut self) -> RateLimitInfo {
        self.pacing.info(Utc::now())
    }
}

fn map_io(e: io::Error) -> ProviderError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProviderError::Timeout(e.to_string()),
        io::ErrorKind::InvalidData => ProviderError::Malformed(e.to_string()),
        _ => ProviderError::Transport(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DateRange;
    use chrono::NaiveDate;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// One-connection fake gateway: acks the hello, then answers each
    /// historical request with the next scripted reply batch.
    fn fake_gateway(replies: Vec<Vec<GatewayMessage>>) -> (u16, thread::JoinHandle<Vec<GatewayMessage>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = vec![read_frame(&mut stream).unwrap()];
            write_frame(&mut stream, &GatewayMessage::HelloAck { server_version: 1 }).unwrap();
            for batch in replies {
                let Ok(req) = read_frame(&mut stream) else { break };
                seen.push(req);
                for msg in batch {
                    write_frame(&mut stream, &msg).unwrap();
                }
            }
            seen
        });
        (port, handle)
    }

    fn adapter(port: u16) -> GatewayAdapter {
        GatewayAdapter::new(GatewayConfig {
            port,
            read_timeout: Duration::from_secs(5),
            ..GatewayConfig::default()
        })
    }

    fn bar(time: &str, volume: f64) -> GatewayBar {
        GatewayBar {
            time: time.into(),
            open: 1.10,
            high: 1.11,
            low: 1.09,
            close: 1.105,
            volume,
            wap: Some(1.102),
            bar_count: Some(812.0),
        }
    }

    #[test]
    fn handshake_and_fetch_forex() {
        let (port, server) = fake_gateway(vec![vec![
            GatewayMessage::Error {
                req_id: None,
                code: 2104,
                message: "Market data farm connection is OK".into(),
            },
            GatewayMessage::HistoricalData {
                req_id: 1,
                bars: vec![bar("20240102", -1.0), bar("20240103", -1.0)],
            },
        ]]);
        let mut gw = adapter(port);
        assert!(gw.authenticate(&Credentials::client(7)).unwrap());

        let fx = Instrument::forex("EUR.USD", d(2005, 1, 1), None).unwrap();
        let payload = gw
            .fetch_raw(&FetchRequest {
                instrument: &fx,
                period: Period::Daily,
                range: DateRange::new(d(2024, 1, 1), d(2024, 1, 4)).unwrap(),
            })
            .unwrap();

        let PayloadBody::Table(table) = payload.body else {
            panic!("expected table");
        };
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0][5], RawCell::Number(0.0));
        assert_eq!(table.rows[0][7], RawCell::Number(812.0));

        let seen = server.join().unwrap();
        assert_eq!(
            seen[0],
            GatewayMessage::Hello {
                client_id: 7,
                version: PROTOCOL_VERSION
            }
        );
        match &seen[1] {
            GatewayMessage::HistoricalRequest {
                contract,
                what_to_show,
                duration,
                end,
                ..
            } => {
                assert_eq!(contract.sec_type, "CASH");
                assert_eq!(contract.symbol, "EUR");
                assert_eq!(contract.currency, "USD");
                assert_eq!(what_to_show, "MIDPOINT");
                assert_eq!(duration, "3 D");
                assert_eq!(end, "20240104-00:00:00");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn error_codes_map_to_provider_errors() {
        let (port, server) = fake_gateway(vec![
            vec![GatewayMessage::Error {
                req_id: Some(1),
                code: 200,
                message: "No security definition has been found".into(),
            }],
            vec![GatewayMessage::Error {
                req_id: Some(2),
                code: 162,
                message: "Historical Market Data Service error message:pacing violation".into(),
            }],
        ]);
        let mut gw = adapter(port);
        assert!(gw.authenticate(&Credentials::none()).unwrap());
        let stock = Instrument::stock("NOPE", d(2000, 1, 1), None).unwrap();
        let req = FetchRequest {
            instrument: &stock,
            period: Period::Daily,
            range: DateRange::new(d(2024, 1, 1), d(2024, 2, 1)).unwrap(),
        };
        assert!(matches!(gw.fetch_raw(&req), Err(ProviderError::NotFound { .. })));
        assert!(matches!(gw.fetch_raw(&req), Err(ProviderError::RateLimited { .. })));
        // Pacing violation blocks further requests locally.
        assert_eq!(gw.rate_limit_info().remaining, Some(0));
        assert!(matches!(gw.fetch_raw(&req), Err(ProviderError::RateLimited { .. })));
        drop(gw);
        server.join().unwrap();
    }

    #[test]
    fn no_data_notice_yields_empty_table() {
        let (port, server) = fake_gateway(vec![vec![GatewayMessage::Error {
            req_id: Some(1),
            code: 162,
            message: "Historical Market Data Service error message:HMDS query returned no data".into(),
        }]]);
        let mut gw = adapter(port);
        assert!(gw.authenticate(&Credentials::none()).unwrap());
        let gc = Instrument::future("GC", None, d(2000, 1, 1), None).unwrap();
        let payload = gw
            .fetch_raw(&FetchRequest {
                instrument: &gc,
                period: Period::Hour1,
                range: DateRange::new(d(2024, 1, 1), d(2024, 1, 2)).unwrap(),
            })
            .unwrap();
        assert!(matches!(payload.body, PayloadBody::Table(ref t) if t.is_empty()));
        assert_eq!(gw.rate_limit_info().remaining, Some(59));
        server.join().unwrap();
    }

    #[test]
    fn fetch_without_handshake_is_auth_error() {
        let mut gw = adapter(1);
        let stock = Instrument::stock("SPY", d(2000, 1, 1), None).unwrap();
        let req = FetchRequest {
            instrument: &stock,
            period: Period::Daily,
            range: DateRange::new(d(2024, 1, 1), d(2024, 2, 1)).unwrap(),
        };
        assert!(matches!(gw.fetch_raw(&req), Err(ProviderError::Authentication(_))));
    }

    #[test]
    fn unreachable_gateway_is_transport_error() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut gw = adapter(port);
        let err = gw.authenticate(&Credentials::none()).unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[test]
    fn long_durations_stay_close_to_the_span() {
        assert_eq!(GatewayAdapter::duration(30), "30 D");
        assert_eq!(GatewayAdapter::duration(365), "365 D");
        assert_eq!(GatewayAdapter::duration(730), "2 Y");
        assert_eq!(GatewayAdapter::duration(3650), "10 Y");
        // 400 days asks for 58 weeks (406 days), not two years.
        assert_eq!(GatewayAdapter::duration(400), "58 W");
        assert_eq!(GatewayAdapter::duration(366), "53 W");
    }

    #[test]
    fn bad_frame_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let mut hellos = 0;
            // First connection: answer the request with an oversized length prefix.
            let (mut first, _) = listener.accept().unwrap();
            read_frame(&mut first).unwrap();
            hellos += 1;
            write_frame(&mut first, &GatewayMessage::HelloAck { server_version: 1 }).unwrap();
            read_frame(&mut first).unwrap();
            first.write_all(&u32::MAX.to_be_bytes()).unwrap();

            let (mut second, _) = listener.accept().unwrap();
            read_frame(&mut second).unwrap();
            hellos += 1;
            write_frame(&mut second, &GatewayMessage::HelloAck { server_version: 1 }).unwrap();
            let GatewayMessage::HistoricalRequest { req_id, .. } = read_frame(&mut second).unwrap() else {
                panic!("expected a history request");
            };
            write_frame(
                &mut second,
                &GatewayMessage::HistoricalData {
                    req_id,
                    bars: vec![bar("20240102", 1000.0)],
                },
            )
            .unwrap();
            hellos
        });

        let mut gw = adapter(port);
        assert!(gw.authenticate(&Credentials::client(3)).unwrap());
        let spy = Instrument::stock("SPY", d(2000, 1, 1), None).unwrap();
        let req = FetchRequest {
            instrument: &spy,
            period: Period::Daily,
            range: DateRange::new(d(2024, 1, 1), d(2024, 1, 3)).unwrap(),
        };

        assert!(matches!(gw.fetch_raw(&req), Err(ProviderError::Malformed(_))));
        let payload = gw.fetch_raw(&req).unwrap();
        assert!(matches!(payload.body, PayloadBody::Table(ref t) if t.len() == 1));
        assert_eq!(server.join().unwrap(), 2);
    }
}
