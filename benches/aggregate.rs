use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use netinsight::config::ResolverConfig;
use netinsight::ebpf::{ConnectionTuple, RawCounterSnapshot};
use netinsight::k8s::{IdentityResolver, StaticDirectory, WorkloadIdentity, WorkloadRef};
use netinsight::metrics::aggregator::{flow_addresses, merge};
use netinsight::metrics::FlowAggregator;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn address(i: usize) -> Ipv4Addr {
    Ipv4Addr::new(10, 244, (i / 250) as u8, (i % 250) as u8 + 1)
}

/// `pairs` flows over a pool of 256 addresses, with one connection per pair
fn generate_snapshot(pairs: usize) -> RawCounterSnapshot {
    let mut builder = RawCounterSnapshot::builder();
    for i in 0..pairs {
        let source = address(i % 256);
        let destination = address((i * 7 + 1) % 256);
        let packets = (i % 100 + 1) as u64;

        builder = builder
            .packets(source, destination, packets)
            .bytes(source, destination, packets * 512)
            .latency(source, destination, packets * 40_000, packets)
            .connection(
                ConnectionTuple {
                    source,
                    destination,
                    source_port: 30000 + (i % 1000) as u16,
                    destination_port: 443,
                    protocol: if i % 3 == 0 { 17 } else { 6 },
                },
                packets,
            );
    }
    builder.drops(1, 3).protocol(6, 1000).build()
}

fn identities(snapshot: &RawCounterSnapshot) -> HashMap<Ipv4Addr, WorkloadIdentity> {
    flow_addresses(snapshot)
        .into_iter()
        .enumerate()
        .map(|(i, addr)| {
            let identity = if i % 5 == 0 {
                WorkloadIdentity::unresolved(addr)
            } else {
                WorkloadIdentity::pod(WorkloadRef::new("bench", format!("pod-{}", i % 40)))
            };
            (addr, identity)
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for size in [100, 1_000, 10_000].iter() {
        let snapshot = generate_snapshot(*size);
        let identities = identities(&snapshot);

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}pairs", size)),
            size,
            |b, _| b.iter(|| merge(black_box(&snapshot), black_box(&identities))),
        );
    }

    group.finish();
}

fn bench_aggregate_cached(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let snapshot = generate_snapshot(1_000);

    let mut directory = StaticDirectory::new();
    for i in 0..256 {
        directory = directory.with_pod(address(i), "bench", &format!("pod-{}", i));
    }
    let aggregator = FlowAggregator::new(IdentityResolver::new(
        Arc::new(directory),
        ResolverConfig::default(),
        CancellationToken::new(),
    ));

    // Warm the cache so the benchmark measures hits only
    rt.block_on(aggregator.aggregate(&snapshot));

    c.bench_function("aggregate_cached_1000pairs", |b| {
        b.to_async(&rt)
            .iter(|| async { aggregator.aggregate(black_box(&snapshot)).await })
    });
}

criterion_group!(benches, bench_merge, bench_aggregate_cached);
criterion_main!(benches);
