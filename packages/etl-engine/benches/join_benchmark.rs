//! Benchmark for the join planner and cache policy
//!
//! Measures:
//! - Left outer join (one required, two optional inputs) by input size
//! - Full outer join by input size
//! - Cache decisions over a wide fan-out DAG

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use etl_engine::{should_cache, Dag, JoinConfig, JoinPlan, LocalBackend, LocalDataset, Record};
use serde_json::json;
use std::collections::HashMap;

/// Keyed input with `size` records spread over `size / 4` keys
fn generate_input(name: &str, size: usize) -> LocalDataset<(String, Record)> {
    let keys = (size / 4).max(1);
    LocalDataset::from_vec(
        (0..size)
            .map(|i| {
                (
                    format!("key_{}", i % keys),
                    json!({"input": name, "seq": i, "payload": format!("value_{}", i)}),
                )
            })
            .collect(),
    )
}

fn generate_inputs(size: usize) -> HashMap<String, LocalDataset<(String, Record)>> {
    ["orders", "customers", "shipments"]
        .iter()
        .map(|name| (name.to_string(), generate_input(name, size)))
        .collect()
}

/// Benchmark left outer join
fn bench_left_outer_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("left_outer_join");
    let backend = LocalBackend::new();
    let config = JoinConfig::new(["orders"]);

    for size in [100, 1_000, 5_000].iter() {
        let inputs = generate_inputs(*size);
        let plan = JoinPlan::new("j", &config, inputs.keys().map(String::as_str)).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let joined = plan.execute(&backend, black_box(&inputs)).unwrap();
                black_box(joined.len())
            });
        });
    }

    group.finish();
}

/// Benchmark full outer join
fn bench_full_outer_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_outer_join");
    let backend = LocalBackend::new();
    let config = JoinConfig::default().with_partitions(8);

    for size in [100, 1_000, 5_000].iter() {
        let inputs = generate_inputs(*size);
        let plan = JoinPlan::new("j", &config, inputs.keys().map(String::as_str)).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let joined = plan.execute(&backend, black_box(&inputs)).unwrap();
                black_box(joined.len())
            });
        });
    }

    group.finish();
}

/// Benchmark cache decisions over every stage of a fan-out DAG
fn bench_cache_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_policy");

    for width in [10, 100, 500].iter() {
        let stages: Vec<String> = std::iter::once("src".to_string())
            .chain((0..*width).map(|i| format!("t{}", i)))
            .chain(std::iter::once("merge".to_string()))
            .collect();
        let connections: Vec<(String, String)> = (0..*width)
            .flat_map(|i| {
                [
                    ("src".to_string(), format!("t{}", i)),
                    (format!("t{}", i), "merge".to_string()),
                ]
            })
            .collect();
        let dag = Dag::new(stages.clone(), connections).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| {
                let cached = stages
                    .iter()
                    .filter(|s| should_cache(black_box(&dag), s))
                    .count();
                black_box(cached)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_left_outer_join,
    bench_full_outer_join,
    bench_cache_policy
);
criterion_main!(benches);
