//! Benchmarks for module queue operations using criterion.
//!
//! - Single job round trip (submit, admit, run, deliver)
//! - Batches of jobs through a bounded queue
//! - Draining a backlog queued while the module was not ready
//! - Parent fan-out with suspension and readmission

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Value, json};
use shoal::{JobRequest, Module, ModuleBuilder};
use shoal_testkit::{TestHandler, fan_out};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn module(concurrency: usize) -> Module {
    ModuleBuilder::new("bench")
        .with_concurrency(concurrency)
        .with_job("echo", TestHandler::Echo)
        .with_job("parent", fan_out())
        .build()
        .expect("bench module builds")
}

/// Benchmark: one job from submission to delivered result.
fn bench_round_trip(c: &mut Criterion) {
    let rt = create_runtime();
    let module = module(10);
    rt.block_on(module.initialize()).expect("module initializes");

    let mut group = c.benchmark_group("round_trip");
    group.sample_size(100);
    group.bench_function("echo", |b| {
        b.to_async(&rt).iter(|| async {
            module
                .run_job(JobRequest::new("echo").with_payload(Value::Null))
                .await
                .expect("echo resolves");
        });
    });
    group.finish();
}

/// Benchmark: batches submitted at once through a queue with 4 slots.
fn bench_batch(c: &mut Criterion) {
    let rt = create_runtime();
    let module = module(4);
    rt.block_on(module.initialize()).expect("module initializes");

    let mut group = c.benchmark_group("batch");
    group.sample_size(50);
    for size in [10usize, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("concurrency_4", size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async {
                let completions: Vec<_> = (0..size)
                    .map(|i| module.run_job(JobRequest::new("echo").with_priority((i % 7) as i32)))
                    .collect();
                for completion in completions {
                    completion.await.expect("echo resolves");
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: a backlog ranked and admitted when the module becomes ready.
fn bench_backlog_drain(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("backlog_drain");
    group.sample_size(30);
    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("priorities", size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let module = module(8);
                let completions: Vec<_> = (0..size)
                    .map(|i| {
                        let priority = (i * 31 % 97) as i32;
                        module.run_job(JobRequest::new("echo").with_priority(priority))
                    })
                    .collect();
                module.initialize().await.expect("module initializes");
                for completion in completions {
                    completion.await.expect("echo resolves");
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: parent suspended while N children run, then readmitted.
fn bench_fan_out(c: &mut Criterion) {
    let rt = create_runtime();
    let module = module(2);
    rt.block_on(module.initialize()).expect("module initializes");

    let mut group = c.benchmark_group("fan_out");
    group.sample_size(50);
    for children in [1usize, 10, 50] {
        let specs: Vec<_> = (0..children)
            .map(|i| json!({ "job": "echo", "payload": i }))
            .collect();
        let payload = json!({ "children": specs });
        group.throughput(Throughput::Elements(children as u64));
        group.bench_with_input(BenchmarkId::new("children", children), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                module
                    .run_job(JobRequest::new("parent").with_payload(payload.clone()))
                    .await
                    .expect("parent resolves");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_batch, bench_backlog_drain, bench_fan_out);
criterion_main!(benches);
