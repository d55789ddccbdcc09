//! Benchmarks for the event channel and batch submission using criterion.
//!
//! - Publishing into a channel
//! - Replaying a finished channel from the start and from a cursor
//! - Batch creation over the in-memory store

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;
use runstream::runtime::RunServiceBuilder;
use runstream::{EventChannel, RunId, RunSubmission, StreamMode};
use runstream_testkit::{echo_payload, test_config, ScriptedEngine};
use serde_json::json;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn filled_channel(events: u64) -> Arc<EventChannel> {
    let channel = Arc::new(EventChannel::new(RunId::new()));
    for step in 0..events {
        channel
            .publish(StreamMode::Updates, json!({ "step": step }))
            .expect("publish should succeed");
    }
    channel.finish();
    channel
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_publish");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("1000_events", |b| {
        b.iter(|| filled_channel(1000));
    });

    group.finish();
}

/// Replay cost for late joiners, which read the whole log before going live.
fn bench_replay(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("channel_replay");

    for size in [100u64, 1000, 10_000] {
        let channel = filled_channel(size);
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("from_start", size), &size, |b, _| {
            b.to_async(&rt).iter(|| {
                let channel = Arc::clone(&channel);
                async move { channel.replay_from(0).count().await }
            });
        });
        group.bench_with_input(BenchmarkId::new("from_middle", size), &size, |b, &size| {
            b.to_async(&rt).iter(|| {
                let channel = Arc::clone(&channel);
                async move { channel.replay_from(size / 2).count().await }
            });
        });
    }

    group.finish();
}

fn bench_batch_submit(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("batch_submit");

    for size in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            // Not started: runs stay pending, so only creation is measured.
            let service = RunServiceBuilder::new(test_config())
                .with_engine(ScriptedEngine::new())
                .build()
                .expect("service should build");
            b.to_async(&rt).iter(|| {
                let submissions = (0..size)
                    .map(|_| RunSubmission::stateless(echo_payload("bench")))
                    .collect();
                let service = &service;
                async move { service.submit_batch(submissions).await }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_publish, bench_replay, bench_batch_submit);
criterion_main!(benches);
