//! Domain types for PriceVault

pub mod ids;
pub mod instrument;
pub mod job;
pub mod locator;
pub mod period;
pub mod provider_kind;
pub mod range;
pub mod record;

pub use ids::{CorrelationId, JobId};
pub use instrument::{parse_forex_code, Instrument, InstrumentClass};
pub use job::{DownloadJob, JobStatus};
pub use locator::DatasetLocator;
pub use period::Period;
pub use provider_kind::ProviderKind;
pub use range::{Coverage, DateRange};
pub use record::{check_bar, BarViolation, CanonicalRecord};

use chrono::NaiveDate;
use thiserror::Error;

/// Invalid domain values, detected at construction time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("empty or inverted date range: start {start} must be before end {end}")]
    EmptyRange { start: NaiveDate, end: NaiveDate },

    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    #[error("invalid forex code '{0}' (expected a 6-letter currency pair such as EURUSD)")]
    InvalidForexCode(String),

    #[error("invalid contract cycle '{0}' (expected month codes from FGHJKMNQUVXZ)")]
    InvalidCycle(String),

    #[error("unknown period '{0}'")]
    UnknownPeriod(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}
