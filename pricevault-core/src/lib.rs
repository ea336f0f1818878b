//! PriceVault Core: domain types, provider adapters, resilience, validation and storage.
//!
//! This crate contains everything a single download job needs:
//! - Domain types (instruments, periods, date ranges, canonical records, jobs)
//! - Provider adapters behind the `ProviderAdapter` trait, dispatched by the closed `Provider` enum
//! - Circuit breaker and bounded retry with jittered exponential backoff
//! - Field mapping, typed coercion and OHLC validation with a quality score
//! - Dual-format (Parquet + CSV) storage with priority dedup and atomic commits
//!
//! Scheduling across jobs lives in `pricevault-runner`.

pub mod domain;
pub mod error;
pub mod events;
pub mod provider;
pub mod resilience;
pub mod storage;
pub mod transform;

pub use error::{CircuitOpenError, FailureClass, ProviderError};
pub use events::{EventSink, MemorySink, NullSink, PipelineEvent, TracingSink};
