//! PriceVault CLI: plan, run and status commands.
//!
//! Commands:
//! - `plan`: show the jobs a config would run and the segments already on disk
//! - `run`: download everything the config asks for and print a summary
//! - `status`: list stored datasets from their metadata files

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use pricevault_core::events::TracingSink;
use pricevault_core::storage::StorageBridge;
use pricevault_runner::{plan, EnvCredentials, JobResult, Orchestrator, Plan, RunConfig, RunSummary};

#[derive(Parser)]
#[command(
    name = "pricevault",
    about = "PriceVault CLI: historical market price downloader"
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show planned jobs and skipped segments without downloading.
    Plan {
        /// Path to a TOML run config.
        #[arg(long)]
        config: PathBuf,
    },
    /// Download everything the config asks for.
    Run {
        /// Path to a TOML run config.
        #[arg(long)]
        config: PathBuf,

        /// Also write the run summary as JSON to this file.
        #[arg(long)]
        summary_json: Option<PathBuf>,
    },
    /// List stored datasets.
    Status {
        /// Output root to scan. Defaults to ./data.
        #[arg(long, default_value = "data")]
        output_root: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    match cli.command {
        Commands::Plan { config } => run_plan_cmd(&config),
        Commands::Run {
            config,
            summary_json,
        } => run_download_cmd(&config, summary_json.as_deref()),
        Commands::Status { output_root } => run_status_cmd(&output_root),
    }
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    }
    .context("failed to install log subscriber")
}

fn load_plan(config_path: &Path) -> Result<(RunConfig, Plan)> {
    let config = RunConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let bridge = config.storage.bridge();
    let plan = plan(&config, &bridge).context("planning downloads")?;
    Ok((config, plan))
}

fn run_plan_cmd(config_path: &Path) -> Result<()> {
    let (_, plan) = load_plan(config_path)?;

    println!("Planned jobs: {}", plan.jobs.len());
    if !plan.jobs.is_empty() {
        println!();
        println!(
            "{:>5} {:<10} {:<24} {:<26}",
            "Job", "Provider", "Dataset", "Range"
        );
        println!("{}", "-".repeat(68));
        for job in &plan.jobs {
            println!(
                "{:>5} {:<10} {:<24} {:<26}",
                job.id.0,
                job.provider.to_string(),
                job.locator.to_string(),
                job.range.to_string()
            );
        }
    }

    if !plan.skipped.is_empty() {
        println!();
        println!("Skipped segments: {}", plan.skipped.len());
        for seg in &plan.skipped {
            println!("  {} {} {} ({})", seg.provider, seg.dataset, seg.range, seg.reason);
        }
    }
    Ok(())
}

fn run_download_cmd(config_path: &Path, summary_json: Option<&Path>) -> Result<()> {
    let (config, plan) = load_plan(config_path)?;
    info!(
        jobs = plan.jobs.len(),
        skipped = plan.skipped.len(),
        providers = plan.providers().len(),
        "starting run"
    );
    let orchestrator = Orchestrator::from_config(&config, EnvCredentials, Arc::new(TracingSink));
    let summary = orchestrator.run_plan(plan);

    print_summary(&summary);

    if let Some(path) = summary_json {
        summary
            .write_json(path)
            .with_context(|| format!("writing summary to {}", path.display()))?;
        println!("Summary written to: {}", path.display());
    }

    if summary.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_status_cmd(output_root: &Path) -> Result<()> {
    if !output_root.exists() {
        println!("Output root does not exist: {}", output_root.display());
        return Ok(());
    }

    let datasets = StorageBridge::list(output_root)
        .with_context(|| format!("scanning {}", output_root.display()))?;
    if datasets.is_empty() {
        println!("No datasets under {}", output_root.display());
        return Ok(());
    }

    println!("Output root: {}", output_root.display());
    println!("Datasets: {}", datasets.len());
    println!();
    println!(
        "{:<8} {:<5} {:<10} {:>8} {:<23} {:>7} {:<20}",
        "Type", "Per", "Symbol", "Rows", "Range", "Quality", "Updated"
    );
    println!("{}", "-".repeat(88));
    for meta in &datasets {
        let range = match (meta.first_timestamp, meta.last_timestamp) {
            (Some(first), Some(last)) => {
                format!("{} to {}", first.format("%Y-%m-%d"), last.format("%Y-%m-%d"))
            }
            _ => "(empty)".into(),
        };
        let quality = meta
            .quality_score
            .map(|q| format!("{:.1}%", q * 100.0))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<8} {:<5} {:<10} {:>8} {:<23} {:>7} {:<20}",
            meta.instrument_type,
            meta.period.code(),
            meta.symbol,
            meta.row_count,
            range,
            quality,
            meta.last_updated.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("=== Run Summary ===");
    println!("Succeeded:      {}", summary.succeeded());
    println!("Failed:         {}", summary.failed());
    println!("Skipped:        {}", summary.skipped.len());
    println!("Rows persisted: {}", summary.rows_persisted());
    println!(
        "Elapsed:        {:.1}s",
        (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0
    );

    let failures: Vec<&JobResult> = summary.results.iter().filter(|r| !r.succeeded()).collect();
    if !failures.is_empty() {
        println!();
        println!("--- Failures ---");
        for r in failures {
            let reason = r
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            println!(
                "{:>5} {:<10} {:<10} {:<5} {} {reason}",
                r.job_id.0,
                r.provider.to_string(),
                r.symbol,
                r.period.to_string(),
                r.range
            );
        }
    }
    println!();
}
