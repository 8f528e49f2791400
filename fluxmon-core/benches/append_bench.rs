//! Benchmarks for the append path and a simple aggregation over the head.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fluxmon_core::query::{QueryEngine, QueryOptions};
use fluxmon_core::storage::{Engine, StorageConfig};
use fluxmon_core::wal::SyncPolicy;
use fluxmon_core::Labels;
use std::sync::Arc;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Engine {
    let mut config = StorageConfig::with_data_dir(dir.path());
    config.wal.sync_policy = SyncPolicy::None;
    Engine::open(config).unwrap()
}

fn series_labels(n: usize) -> Vec<Labels> {
    (0..n)
        .map(|i| {
            Labels::from_pairs(&[
                ("__name__", "http_requests_total".to_string()),
                ("job", format!("job-{}", i % 10)),
                ("instance", format!("host-{}:9100", i)),
            ])
        })
        .collect()
}

fn bench_append_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_batch");
    for n in [100usize, 1_000, 10_000] {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let labels = series_labels(n);
        let mut t = 0i64;

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &labels, |b, labels| {
            b.iter(|| {
                t += 15_000;
                let batch = labels.iter().map(|l| (l.clone(), t, t as f64)).collect();
                black_box(engine.append_batch(batch).unwrap());
            })
        });
    }
    group.finish();
}

fn bench_sum_by_job(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let labels = series_labels(1_000);
    for step in 0..240 {
        let t = step * 15_000;
        let batch = labels.iter().map(|l| (l.clone(), t, t as f64)).collect();
        engine.append_batch(batch).unwrap();
    }
    let query = QueryEngine::new(Arc::new(engine), QueryOptions::default());

    c.bench_function("sum_by_job_rate_5m", |b| {
        b.iter(|| {
            black_box(
                query
                    .instant_query("sum by (job) (rate(http_requests_total[5m]))", 239 * 15_000)
                    .unwrap(),
            )
        })
    });
}

criterion_group!(benches, bench_append_batch, bench_sum_by_job);
criterion_main!(benches);
