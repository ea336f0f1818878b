//! Wire format of the local brokerage gateway.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. Messages are internally tagged by `"type"`.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Frames above this size are treated as a corrupted stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayBar {
    /// `YYYYMMDD` for daily and longer bars, epoch seconds otherwise.
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub wap: Option<f64>,
    #[serde(default)]
    pub bar_count: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Hello {
        client_id: i32,
        version: u32,
    },
    HelloAck {
        server_version: u32,
    },
    HistoricalRequest {
        req_id: u32,
        contract: Contract,
        /// End of the requested window, `YYYYMMDD-HH:MM:SS` in UTC.
        end: String,
        /// Window length, e.g. `30 D`.
        duration: String,
        bar_size: String,
        what_to_show: String,
        use_rth: bool,
    },
    HistoricalData {
        req_id: u32,
        bars: Vec<GatewayBar>,
    },
    Error {
        #[serde(default)]
        req_id: Option<u32>,
        code: i32,
        message: String,
    },
}

pub fn write_frame(w: &mut impl Write, msg: &GatewayMessage) -> io::Result<()> {
    let body = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(&body)?;
    w.flush()
}

pub fn read_frame(r: &mut impl Read) -> io::Result<GatewayMessage> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
