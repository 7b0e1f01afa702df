use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use leaselog_core::{DispatcherId, StreamId};
use leaselog_infra::{DispatchLeaseManager, EventStore, Storage, StoreConfig, UncommittedEvent};
use leaselog_log::{LogConfig, MemoryLogRegistry};
use std::sync::Arc;

fn fresh_storage() -> Storage<Arc<leaselog_log::MemoryLog>> {
    let registry = MemoryLogRegistry::new(LogConfig::default().with_capacity(64 * 1024 * 1024));
    Storage::open_in_memory(&registry, StoreConfig::default()).expect("open storage")
}

fn events(count: usize) -> Vec<UncommittedEvent> {
    (0..count)
        .map(|i| UncommittedEvent::new("bench.event", format!("{{\"n\":{i}}}")))
        .collect()
}

fn bench_commit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_throughput");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || (fresh_storage(), events(batch_size)),
                    |(storage, events)| {
                        let state = storage
                            .store()
                            .commit_stream(StreamId::new(), events, None)
                            .expect("commit");
                        black_box(state);
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_replay_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_stream_replay");

    for event_count in [100usize, 1000, 10000] {
        let storage = fresh_storage();
        let stream = StreamId::new();
        storage
            .store()
            .commit_stream(stream, events(event_count), None)
            .expect("seed");

        group.throughput(Throughput::Elements(event_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(event_count), &stream, |b, &stream| {
            b.iter(|| black_box(storage.store().get_stream(stream, 0).expect("read")));
        });
    }

    group.finish();
}

fn bench_lease_and_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("lease_and_ack");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || {
                        let storage = fresh_storage();
                        storage
                            .store()
                            .commit_stream(StreamId::new(), events(batch_size), None)
                            .expect("seed");
                        storage
                    },
                    |storage| {
                        let dispatcher = DispatcherId::default_group();
                        let leases = storage.leases();
                        let batch = leases
                            .get_next_undispatched_batch(&dispatcher, batch_size)
                            .expect("lease")
                            .expect("events available");
                        leases
                            .mark_event_as_dispatched(&dispatcher, batch.upper_bound())
                            .expect("ack");
                        black_box(batch);
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_commit_throughput,
    bench_replay_speed,
    bench_lease_and_ack
);
criterion_main!(benches);
