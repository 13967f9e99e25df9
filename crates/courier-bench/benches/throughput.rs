//! Throughput benchmarks for Courier.
//!
//! These benchmarks measure the raw throughput of history, broker publish
//! and local fan-out.

use bytes::Bytes;
use courier_core::{
    Broker, HistoryBuffer, HistoryOptions, MemoryStore, Publication, Push, Shard, ShardRing,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const META_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn broker(shards: usize) -> (Broker, mpsc::UnboundedReceiver<Push>) {
    let shards: Vec<Shard> = (0..shards)
        .map(|i| Shard::new(format!("s{i}"), Arc::new(MemoryStore::new(META_TTL))))
        .collect();
    for shard in &shards {
        shard.connect().await.unwrap();
    }
    let broker = Broker::new("bench", ShardRing::new(shards).unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    broker.register(tx).await.unwrap();
    (broker, rx)
}

/// Benchmark history appends and recovery reads.
fn bench_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("history");
    let payload = Bytes::from(vec![b'x'; 64]);
    let options = HistoryOptions::default();

    group.throughput(Throughput::Elements(1));
    group.bench_function("append", |b| {
        let buffer = HistoryBuffer::new(META_TTL);
        b.iter(|| buffer.append(black_box("news"), payload.clone(), None, &options));
    });

    group.bench_function("append_1000_channels", |b| {
        let buffer = HistoryBuffer::new(META_TTL);
        let channels: Vec<String> = (0..1000).map(|i| format!("channel:{i}")).collect();
        let mut i = 0;
        b.iter(|| {
            let channel = &channels[i % channels.len()];
            i += 1;
            buffer.append(black_box(channel), payload.clone(), None, &options)
        });
    });

    group.bench_function("recover_full", |b| {
        let buffer = HistoryBuffer::new(META_TTL);
        for _ in 0..options.size {
            buffer.append("news", payload.clone(), None, &options);
        }
        b.iter(|| buffer.recover(black_box("news"), 0));
    });

    group.finish();
}

/// Benchmark publish through the shard store, including fan-out to the node.
fn bench_broker_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_publish");
    let rt = runtime();
    let payload = Bytes::from(vec![b'x'; 64]);

    for (name, history) in [
        ("with_history", HistoryOptions::default()),
        ("without_history", HistoryOptions::NONE),
    ] {
        group.bench_function(name, |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let (broker, mut node_rx) = broker(4).await;
                    let (tx, _rx) = mpsc::unbounded_channel();
                    broker.attach("news", "conn-1", tx).await.unwrap();

                    let start = Instant::now();
                    for _ in 0..iters {
                        broker
                            .publish("news", payload.clone(), None, &history)
                            .await
                            .unwrap();
                        while node_rx.try_recv().is_ok() {}
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

/// Benchmark local delivery to many sessions.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");
    let rt = runtime();

    for size in [10usize, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (broker, _node_rx) = rt.block_on(broker(1));
            let mut receivers = Vec::with_capacity(size);
            for i in 0..size {
                let (tx, rx) = mpsc::unbounded_channel();
                rt.block_on(broker.attach("broadcast", &format!("conn-{i}"), tx))
                    .unwrap();
                receivers.push(rx);
            }
            let push = Push::Publication(Publication::new("broadcast", vec![b'x'; 64]));

            b.iter(|| {
                let delivered = broker.deliver(black_box(&push));
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
                delivered
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_history, bench_broker_publish, bench_fanout);
criterion_main!(benches);
