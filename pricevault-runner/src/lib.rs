//! PriceVault Runner: run configuration, job planning and orchestration.
//!
//! This crate builds on `pricevault-core` to provide:
//! - TOML run configuration with validation
//! - Credential sources (static, environment)
//! - Deterministic planning into provider-sized jobs, with incremental skips
//! - Provider lanes on a bounded worker pool
//! - Per-job results and a serializable run summary

pub mod config;
pub mod credentials;
pub mod lane;
pub mod orchestrator;
pub mod plan;
pub mod summary;

pub use config::{ConfigError, DownloadRequest, RunConfig};
pub use credentials::{CredentialError, CredentialSource, EnvCredentials, StaticCredentials};
pub use lane::{build_lanes, Lane};
pub use orchestrator::{ConfiguredProviders, Orchestrator, ProviderFactory, RunSettings};
pub use plan::{plan, plan_requests, Plan, PlanError, SkipReason, SkippedSegment};
pub use summary::{FailureReason, JobResult, RunSummary};
