//! End-to-end runs against scripted providers.
//!
//! Every test plans real download requests, runs them through the
//! orchestrator with offline transports and checks job results, events and
//! the files left on disk.

use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pricevault_core::domain::{DatasetLocator, DateRange, Instrument, JobStatus, Period, ProviderKind};
use pricevault_core::error::ProviderError;
use pricevault_core::events::{MemorySink, PipelineEvent};
use pricevault_core::provider::{
    BarchartAdapter, BarchartConfig, Credentials, HttpResponse, Provider, ScriptedTransport,
    TransportFailure, YahooAdapter, YahooConfig,
};
use pricevault_core::resilience::{BreakerConfig, CircuitState, RetryPolicy};
use pricevault_core::storage::StorageBridge;
use pricevault_core::transform::QualityPolicy;
use pricevault_runner::{
    plan_requests, DownloadRequest, FailureReason, Orchestrator, RunSettings, SkipReason,
    StaticCredentials,
};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "pricevault_runner_test_{}_{id}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn settings(threshold: u32, max_retries: u32) -> RunSettings {
    RunSettings {
        workers: None,
        breaker: BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
        },
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.25,
            max_rate_limit_wait: Duration::from_millis(50),
        },
        quality: QualityPolicy::default(),
        seed: Some(7),
    }
}

fn stock_request(root: &Path, symbol: &str, provider: ProviderKind) -> DownloadRequest {
    let instrument = Instrument::stock(symbol, d(1980, 12, 12), None).unwrap();
    DownloadRequest {
        instrument: Arc::new(instrument),
        provider,
        range: DateRange::new(d(2024, 1, 2), d(2024, 1, 6)).unwrap(),
        periods: vec![Period::Daily],
        output_root: root.to_path_buf(),
    }
}

const CHART: &str = r#"{
    "chart": {
        "result": [{
            "timestamp": [1704153600, 1704240000, 1704326400],
            "indicators": {
                "quote": [{
                    "open": [187.15, 184.22, 182.15],
                    "high": [188.44, 185.88, 183.09],
                    "low": [183.89, 183.43, 180.88],
                    "close": [185.64, 184.25, 181.91],
                    "volume": [82488700, 58414500, 71983600]
                }],
                "adjclose": [{ "adjclose": [184.93, 183.55, 181.22] }]
            }
        }],
        "error": null
    }
}"#;

const LOGIN_PAGE: &str = r#"<html><head>
    <meta name="csrf-token" content="tok-123">
    </head><body></body></html>"#;

/// Barchart history rows (the adapter prepends the header).
const BARCHART_ROWS: &str = "\
SPY,2024-01-03,184.30,186.00,183.50,184.40,58000000,0
SPY,2024-01-04,182.20,183.20,180.90,182.00,72000000,0
SPY,2024-01-05,181.99,182.76,180.17,181.18,62000000,0
";

fn yahoo_config() -> YahooConfig {
    YahooConfig {
        base_url: "https://yf.test".into(),
        cookie_url: "https://cookie.test".into(),
        timeout: Duration::from_secs(5),
        requests_per_window: 100,
        window: Duration::from_secs(60),
    }
}

fn yahoo_script() -> ScriptedTransport {
    let script = ScriptedTransport::new();
    script
        .on("cookie.test", Ok(HttpResponse::new(404, "")))
        .on("getcrumb", Ok(HttpResponse::new(200, "crumb123")));
    script
}

fn barchart_script() -> ScriptedTransport {
    let script = ScriptedTransport::new();
    script
        .on("/login", Ok(HttpResponse::new(200, LOGIN_PAGE)))
        .on("/login", Ok(HttpResponse::new(200, "welcome")))
        .on("queryeod", Ok(HttpResponse::new(200, BARCHART_ROWS)));
    script
}

/// Factory serving scripted adapters; providers without a script are unavailable.
fn scripted(
    yahoo: Option<ScriptedTransport>,
    barchart: Option<ScriptedTransport>,
) -> impl Fn(ProviderKind) -> Result<Provider, ProviderError> + Send + Sync {
    move |kind| match kind {
        ProviderKind::Yahoo => yahoo
            .clone()
            .map(|s| Provider::Yahoo(YahooAdapter::with_transport(yahoo_config(), Box::new(s))))
            .ok_or_else(|| ProviderError::Transport("yahoo not scripted".into())),
        ProviderKind::Barchart => barchart
            .clone()
            .map(|s| {
                Provider::Barchart(BarchartAdapter::with_transport(
                    BarchartConfig {
                        base_url: "https://bc.test".into(),
                        ..BarchartConfig::default()
                    },
                    Box::new(s),
                ))
            })
            .ok_or_else(|| ProviderError::Transport("barchart not scripted".into())),
        ProviderKind::Gateway => Err(ProviderError::Transport("gateway not scripted".into())),
    }
}

fn barchart_login() -> StaticCredentials {
    StaticCredentials::new().with(ProviderKind::Barchart, Credentials::login("trader", "pw"))
}

#[test]
fn transport_errors_then_success_completes_the_job() {
    let root = temp_root();
    let script = yahoo_script();
    for _ in 0..3 {
        script.on(
            "/v8/finance/chart/",
            Err(TransportFailure::Connect("connection reset".into())),
        );
    }
    script.on("/v8/finance/chart/", Ok(HttpResponse::new(200, CHART)));

    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(
        settings(5, 3),
        StorageBridge::default(),
        scripted(Some(script.clone()), None),
        StaticCredentials::new(),
        sink.clone(),
    );
    let plan = plan_requests(
        &[stock_request(&root, "AAPL", ProviderKind::Yahoo)],
        orchestrator.storage(),
    )
    .unwrap();
    let summary = orchestrator.run_plan(plan);

    assert_eq!(summary.results.len(), 1);
    let job = &summary.results[0];
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 4);
    assert_eq!(job.rows_persisted, 3);
    assert_eq!(script.count("/v8/finance/chart/"), 4);
    assert_eq!(
        sink.count(|e| matches!(e, PipelineEvent::RetryScheduled { .. })),
        3
    );
    assert_eq!(
        sink.count(|e| matches!(e, PipelineEvent::CircuitTransition { to: CircuitState::Open, .. })),
        0
    );
    assert_eq!(
        sink.count(|e| matches!(e, PipelineEvent::MergeCommitted { rows_after: 3, .. })),
        1
    );
    assert!(root.join("stocks/1d/AAPL.parquet").exists());
    assert!(root.join("stocks/1d/AAPL.csv").exists());
}

#[test]
fn open_circuit_rejects_the_sixth_job_without_a_call() {
    let root = temp_root();
    let script = yahoo_script();
    script.on("/v8/finance/chart/", Ok(HttpResponse::new(503, "unavailable")));

    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(
        settings(5, 0),
        StorageBridge::default(),
        scripted(Some(script.clone()), None),
        StaticCredentials::new(),
        sink.clone(),
    );
    let requests: Vec<_> = ["AAPL", "MSFT", "NVDA", "AMZN", "META", "GOOG"]
        .iter()
        .map(|s| stock_request(&root, s, ProviderKind::Yahoo))
        .collect();
    let plan = plan_requests(&requests, orchestrator.storage()).unwrap();
    assert_eq!(plan.jobs.len(), 6);

    let summary = orchestrator.run(plan.jobs);

    assert_eq!(summary.failed(), 6);
    for result in &summary.results[..5] {
        assert!(matches!(result.failure, Some(FailureReason::Server(_))), "{result:?}");
        assert_eq!(result.attempts, 1);
    }
    let sixth = &summary.results[5];
    assert!(matches!(sixth.failure, Some(FailureReason::CircuitOpen(_))));
    assert_eq!(sixth.attempts, 0);
    assert_eq!(script.count("/v8/finance/chart/"), 5);
    assert_eq!(
        sink.count(|e| matches!(e, PipelineEvent::CircuitTransition { to: CircuitState::Open, .. })),
        1
    );
    assert_eq!(
        sink.count(|e| matches!(e, PipelineEvent::JobFailed { .. })),
        6
    );
}

#[test]
fn rejected_credentials_fail_remaining_jobs_of_that_provider_only() {
    let root = temp_root();
    let yahoo = yahoo_script();
    yahoo.on("/v8/finance/chart/", Ok(HttpResponse::new(200, CHART)));
    let barchart = barchart_script();

    // No Barchart login configured.
    let orchestrator = Orchestrator::new(
        settings(5, 1),
        StorageBridge::default(),
        scripted(Some(yahoo.clone()), Some(barchart.clone())),
        StaticCredentials::new(),
        Arc::new(MemorySink::new()),
    );
    let plan = plan_requests(
        &[
            stock_request(&root, "GC", ProviderKind::Barchart),
            stock_request(&root, "SI", ProviderKind::Barchart),
            stock_request(&root, "AAPL", ProviderKind::Yahoo),
        ],
        orchestrator.storage(),
    )
    .unwrap();
    let summary = orchestrator.run(plan.jobs);

    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.failed(), 2);
    for result in summary.results.iter().filter(|r| r.provider == ProviderKind::Barchart) {
        assert!(matches!(result.failure, Some(FailureReason::Authentication(_))));
    }
    assert_eq!(barchart.count("/login"), 0);
    assert_eq!(barchart.count("queryeod"), 0);
}

#[test]
fn expired_session_is_renewed_once_and_the_fetch_repeated() {
    let root = temp_root();
    let script = yahoo_script();
    script
        .on("/v8/finance/chart/", Ok(HttpResponse::new(401, "Invalid Crumb")))
        .on("/v8/finance/chart/", Ok(HttpResponse::new(200, CHART)));

    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(
        settings(5, 3),
        StorageBridge::default(),
        scripted(Some(script.clone()), None),
        StaticCredentials::new(),
        sink.clone(),
    );
    let plan = plan_requests(
        &[stock_request(&root, "AAPL", ProviderKind::Yahoo)],
        orchestrator.storage(),
    )
    .unwrap();
    let summary = orchestrator.run(plan.jobs);

    assert_eq!(summary.results[0].status, JobStatus::Succeeded);
    assert_eq!(summary.results[0].attempts, 2);
    assert_eq!(script.count("getcrumb"), 2);
    assert_eq!(
        sink.count(|e| matches!(e, PipelineEvent::Reauthenticated { success: true, .. })),
        1
    );
}

#[test]
fn providers_sharing_a_dataset_merge_by_priority() {
    let root = temp_root();
    let yahoo = yahoo_script();
    yahoo.on("/v8/finance/chart/", Ok(HttpResponse::new(200, CHART)));
    let barchart = barchart_script();

    let mut run_settings = settings(5, 1);
    run_settings.workers = Some(2);
    let orchestrator = Orchestrator::new(
        run_settings,
        StorageBridge::new(vec![ProviderKind::Barchart, ProviderKind::Yahoo], 1),
        scripted(Some(yahoo), Some(barchart.clone())),
        barchart_login(),
        Arc::new(MemorySink::new()),
    );
    let plan = plan_requests(
        &[
            stock_request(&root, "SPY", ProviderKind::Yahoo),
            stock_request(&root, "SPY", ProviderKind::Barchart),
        ],
        orchestrator.storage(),
    )
    .unwrap();
    let summary = orchestrator.run(plan.jobs);

    assert_eq!(summary.succeeded(), 2, "{summary:#?}");
    assert_eq!(barchart.count("/login"), 2);

    let inst = Instrument::stock("SPY", d(1993, 1, 29), None).unwrap();
    let locator = pricevault_core::domain::DatasetLocator::new(&root, &inst, Period::Daily);
    let records = orchestrator.storage().load(&locator).unwrap();
    // Jan 2 from Yahoo only; Jan 3-5 from Barchart, which outranks Yahoo.
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].provider, ProviderKind::Yahoo);
    assert!(records[1..].iter().all(|r| r.provider == ProviderKind::Barchart));
    assert_eq!(records[1].close, 184.40);

    let meta = orchestrator.storage().read_meta(&locator).unwrap().unwrap();
    assert_eq!(meta.row_count, 4);
    assert_eq!(meta.providers[&ProviderKind::Barchart], 3);
}

#[test]
fn second_plan_skips_what_the_first_run_fetched() {
    let root = temp_root();
    let script = yahoo_script();
    script.on("/v8/finance/chart/", Ok(HttpResponse::new(200, CHART)));

    let orchestrator = Orchestrator::new(
        settings(5, 1),
        StorageBridge::default(),
        scripted(Some(script.clone()), None),
        StaticCredentials::new(),
        Arc::new(MemorySink::new()),
    );
    let requests = [stock_request(&root, "AAPL", ProviderKind::Yahoo)];

    let first = plan_requests(&requests, orchestrator.storage()).unwrap();
    assert_eq!(first.jobs.len(), 1);
    assert!(!orchestrator.run_plan(first).has_failures());

    let second = plan_requests(&requests, orchestrator.storage()).unwrap();
    assert!(second.jobs.is_empty());
    assert_eq!(second.skipped.len(), 1);
    assert_eq!(second.skipped[0].reason, SkipReason::AlreadyCovered);
    assert_eq!(second.skipped[0].dataset, "stocks/1d/AAPL");
}

#[test]
fn range_without_bars_is_not_fetched_again() {
    let root = temp_root();
    let script = yahoo_script();
    script.on(
        "/v8/finance/chart/",
        Ok(HttpResponse::new(
            200,
            r#"{"chart":{"result":[{"indicators":{"quote":[{}]}}],"error":null}}"#,
        )),
    );

    let orchestrator = Orchestrator::new(
        settings(5, 1),
        StorageBridge::default(),
        scripted(Some(script.clone()), None),
        StaticCredentials::new(),
        Arc::new(MemorySink::new()),
    );
    let holiday = DownloadRequest {
        range: DateRange::new(d(2023, 12, 30), d(2024, 1, 2)).unwrap(),
        ..stock_request(&root, "AAPL", ProviderKind::Yahoo)
    };
    let requests = [holiday];

    let first = plan_requests(&requests, orchestrator.storage()).unwrap();
    let summary = orchestrator.run_plan(first);
    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.rows_persisted(), 0);
    assert_eq!(script.count("/v8/finance/chart/"), 1);

    let second = plan_requests(&requests, orchestrator.storage()).unwrap();
    assert!(second.jobs.is_empty());
    assert_eq!(second.skipped.len(), 1);
    assert_eq!(second.skipped[0].reason, SkipReason::AlreadyCovered);

    let locator = DatasetLocator::new(
        root.clone(),
        &requests[0].instrument,
        Period::Daily,
    );
    let meta = orchestrator.storage().read_meta(&locator).unwrap().unwrap();
    assert_eq!(meta.row_count, 0);
    assert!(!locator.primary_path().exists());
}

#[test]
fn cancelled_run_fails_every_job_without_network() {
    let root = temp_root();
    let script = yahoo_script();
    script.on("/v8/finance/chart/", Ok(HttpResponse::new(200, CHART)));

    let orchestrator = Orchestrator::new(
        settings(5, 1),
        StorageBridge::default(),
        scripted(Some(script.clone()), None),
        StaticCredentials::new(),
        Arc::new(MemorySink::new()),
    );
    let plan = plan_requests(
        &[
            stock_request(&root, "AAPL", ProviderKind::Yahoo),
            stock_request(&root, "MSFT", ProviderKind::Yahoo),
        ],
        orchestrator.storage(),
    )
    .unwrap();
    orchestrator.cancel_token().cancel();
    let summary = orchestrator.run(plan.jobs);

    assert_eq!(summary.failed(), 2);
    assert!(summary
        .results
        .iter()
        .all(|r| r.failure == Some(FailureReason::Cancelled)));
    assert!(script.requests().is_empty());
}

#[test]
fn unavailable_provider_does_not_stop_others() {
    let root = temp_root();
    let yahoo = yahoo_script();
    yahoo.on("/v8/finance/chart/", Ok(HttpResponse::new(200, CHART)));

    let orchestrator = Orchestrator::new(
        settings(5, 1),
        StorageBridge::default(),
        scripted(Some(yahoo), None),
        StaticCredentials::new(),
        Arc::new(MemorySink::new()),
    );
    let plan = plan_requests(
        &[
            stock_request(&root, "QQQ", ProviderKind::Gateway),
            stock_request(&root, "AAPL", ProviderKind::Yahoo),
        ],
        orchestrator.storage(),
    )
    .unwrap();
    let summary = orchestrator.run(plan.jobs);

    assert_eq!(summary.succeeded(), 1);
    let gateway = summary
        .results
        .iter()
        .find(|r| r.provider == ProviderKind::Gateway)
        .unwrap();
    assert!(matches!(gateway.failure, Some(FailureReason::ProviderUnavailable(_))));
}
