//! Criterion benchmarks for PriceVault hot paths.
//!
//! Benchmarks:
//! 1. Priority dedup of an existing dataset against an overlapping batch
//! 2. Transform of a raw table into validated records
//! 3. Full commit (Parquet + CSV + metadata) to a temp directory

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;

use pricevault_core::domain::{CanonicalRecord, DatasetLocator, Instrument, Period, ProviderKind};
use pricevault_core::provider::{PayloadBody, RawCell, RawPayload, RawTable};
use pricevault_core::storage::merge::dedup;
use pricevault_core::storage::StorageBridge;
use pricevault_core::transform::{transform, FieldMap, QualityPolicy};

// ── Helpers ──────────────────────────────────────────────────────────

fn make_records(n: usize, offset: usize, provider: ProviderKind) -> Vec<CanonicalRecord> {
    let base = Utc.with_ymd_and_hms(2000, 1, 3, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let close = 100.0 + ((i + offset) as f64 * 0.1).sin() * 10.0;
            CanonicalRecord {
                timestamp: base + Duration::days((i + offset) as i64),
                symbol: "SPY".into(),
                provider,
                open: close - 0.3,
                high: close + 1.5,
                low: close - 1.5,
                close,
                volume: 1_000_000 + (i as u64 % 500_000),
                fetched_at: base + Duration::days(9000),
                extras: BTreeMap::new(),
            }
        })
        .collect()
}

fn make_yahoo_table(n: usize) -> RawTable {
    let mut table = RawTable::new(&["timestamp", "open", "high", "low", "close", "volume", "adjclose"]);
    let base = Utc.with_ymd_and_hms(2000, 1, 3, 0, 0, 0).unwrap().timestamp();
    for i in 0..n {
        let close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
        table.push(
            [
                (base + i as i64 * 86_400) as f64,
                close - 0.3,
                close + 1.5,
                close - 1.5,
                close,
                1_000_000.0,
                close,
            ]
            .into_iter()
            .map(RawCell::Number)
            .collect(),
        );
    }
    table
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_dedup(c: &mut Criterion) {
    let priority = [ProviderKind::Barchart, ProviderKind::Yahoo];
    let mut group = c.benchmark_group("dedup");
    for n in [1_000usize, 10_000, 50_000] {
        let existing = make_records(n, 0, ProviderKind::Yahoo);
        // Half overlaps, half extends the series.
        let incoming = make_records(n / 2, n * 3 / 4, ProviderKind::Barchart);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                dedup(
                    black_box(existing.clone()),
                    black_box(incoming.clone()),
                    &priority,
                )
            })
        });
    }
    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let payload = RawPayload::new(ProviderKind::Yahoo, "SPY", PayloadBody::Table(make_yahoo_table(5_000)));
    let map = FieldMap::for_provider(ProviderKind::Yahoo);
    let policy = QualityPolicy::default();
    c.bench_function("transform_5000_rows", |b| {
        b.iter(|| transform(black_box(&payload), map, &policy))
    });
}

fn bench_commit(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let spy = Instrument::stock("SPY", NaiveDate::from_ymd_opt(1993, 1, 29).unwrap(), None).unwrap();
    let locator = DatasetLocator::new(dir.path(), &spy, Period::Daily);
    let bridge = StorageBridge::default();
    bridge.merge(&locator, make_records(5_000, 0, ProviderKind::Yahoo)).unwrap();
    let batch = make_records(20, 4_990, ProviderKind::Yahoo);

    c.bench_function("commit_20_into_5000", |b| {
        b.iter(|| bridge.merge(&locator, black_box(batch.clone())).unwrap())
    });
}

criterion_group!(benches, bench_dedup, bench_transform, bench_commit);
criterion_main!(benches);
