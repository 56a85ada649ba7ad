//! Flow aggregator joining a counter snapshot with workload identities
//!
//! Packet and byte counts are merged per raw address pair, then grouped by
//! (source identity, destination identity, protocol). Pairs that collapse
//! onto the same group have their counters summed.

use super::record::{
    AggregatedInterval, ConnectionRecord, DropBreakdown, FlowRecord, IntervalSummary,
    ProtocolBreakdown,
};
use crate::ebpf::{AddressPair, ConnectionTuple, LatencyTotals, Protocol, RawCounterSnapshot};
use crate::k8s::{IdentityResolver, WorkloadIdentity};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tracing::debug;

type GroupKey = (WorkloadIdentity, WorkloadIdentity, Option<Protocol>);

#[derive(Debug, Default)]
struct GroupTotals {
    packets: u64,
    bytes: u64,
    latency: LatencyTotals,
}

/// Turns snapshots into [`AggregatedInterval`]s using a shared resolver
#[derive(Clone)]
pub struct FlowAggregator {
    resolver: IdentityResolver,
}

impl FlowAggregator {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Resolve every flow address once, then merge
    pub async fn aggregate(&self, snapshot: &RawCounterSnapshot) -> AggregatedInterval {
        let addresses = flow_addresses(snapshot);
        debug!(addresses = addresses.len(), "Resolving flow addresses");

        let (identities, inventory) = futures::join!(
            self.resolver.resolve_many(addresses),
            self.resolver.inventory()
        );

        let mut interval = merge(snapshot, &identities);
        interval.resolver = self.resolver.stats();
        interval.inventory = inventory;
        interval
    }
}

/// Distinct addresses of every pair with a packet or byte count
pub fn flow_addresses(snapshot: &RawCounterSnapshot) -> BTreeSet<Ipv4Addr> {
    flow_pairs(snapshot)
        .into_iter()
        .flat_map(|pair| [pair.source, pair.destination])
        .collect()
}

fn flow_pairs(snapshot: &RawCounterSnapshot) -> BTreeSet<AddressPair> {
    snapshot
        .packet_counts()
        .keys()
        .chain(snapshot.byte_counts().keys())
        .copied()
        .collect()
}

/// Merge a snapshot given already resolved identities. Addresses absent
/// from `identities` are treated as unresolved.
pub fn merge(
    snapshot: &RawCounterSnapshot,
    identities: &HashMap<Ipv4Addr, WorkloadIdentity>,
) -> AggregatedInterval {
    let identify = |address: Ipv4Addr| {
        identities
            .get(&address)
            .cloned()
            .unwrap_or_else(|| WorkloadIdentity::unresolved(address))
    };

    let protocols = best_protocols(snapshot.connection_tuples());
    let pairs = flow_pairs(snapshot);
    let mut groups: BTreeMap<GroupKey, GroupTotals> = BTreeMap::new();

    for pair in &pairs {
        let key = (
            identify(pair.source),
            identify(pair.destination),
            protocols.get(pair).copied(),
        );
        let totals = groups.entry(key).or_default();

        let packets = snapshot.packet_counts().get(pair).copied().unwrap_or(0);
        let bytes = snapshot.byte_counts().get(pair).copied().unwrap_or(0);
        totals.packets = totals.packets.saturating_add(packets);
        totals.bytes = totals.bytes.saturating_add(bytes);

        if let Some(latency) = snapshot.latency_totals().get(pair) {
            totals.latency.merge(*latency);
        }
    }

    let flows: Vec<FlowRecord> = groups
        .into_iter()
        .map(|((source, destination, protocol), totals)| {
            flow_record(source, destination, protocol, totals)
        })
        .collect();

    let addresses: BTreeSet<Ipv4Addr> = pairs
        .iter()
        .flat_map(|pair| [pair.source, pair.destination])
        .collect();
    let summary = summarize(&flows, &addresses, &identify);

    let mut connections: Vec<ConnectionRecord> = snapshot
        .connection_tuples()
        .iter()
        .map(|(tuple, &packets)| ConnectionRecord::new(tuple, packets))
        .collect();
    connections.sort_by_key(|c| {
        (
            c.source,
            c.destination,
            c.source_port,
            c.destination_port,
            c.protocol,
        )
    });

    AggregatedInterval {
        taken_at: snapshot.taken_at(),
        flows,
        connections,
        drops: DropBreakdown::from_counts(snapshot.drop_counts()),
        protocols: ProtocolBreakdown::from_counts(snapshot.protocol_counts()),
        summary,
        missing_tables: snapshot.missing_tables().to_vec(),
        resolver: Default::default(),
        inventory: None,
    }
}

/// Protocol of the busiest connection per pair. Ties go to the lower
/// protocol number.
fn best_protocols(tuples: &HashMap<ConnectionTuple, u64>) -> HashMap<AddressPair, Protocol> {
    let mut best: HashMap<AddressPair, (u64, u8)> = HashMap::new();

    for (tuple, &packets) in tuples {
        let candidate = (packets, tuple.protocol);
        best.entry(tuple.pair())
            .and_modify(|current| {
                if packets > current.0 || (packets == current.0 && tuple.protocol < current.1) {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    best.into_iter()
        .map(|(pair, (_, number))| (pair, Protocol::from_number(number)))
        .collect()
}

fn flow_record(
    source: WorkloadIdentity,
    destination: WorkloadIdentity,
    protocol: Option<Protocol>,
    totals: GroupTotals,
) -> FlowRecord {
    let average_latency_seconds = totals.latency.average_ns().map(|ns| ns / 1e9);
    let bytes_per_packet = if totals.packets > 0 {
        Some(totals.bytes as f64 / totals.packets as f64)
    } else {
        None
    };

    FlowRecord {
        source,
        destination,
        protocol,
        packet_count: totals.packets,
        byte_count: totals.bytes,
        latency: totals.latency,
        average_latency_seconds,
        bytes_per_packet,
    }
}

fn summarize(
    flows: &[FlowRecord],
    addresses: &BTreeSet<Ipv4Addr>,
    identify: &impl Fn(Ipv4Addr) -> WorkloadIdentity,
) -> IntervalSummary {
    let sources: BTreeSet<&WorkloadIdentity> = flows.iter().map(|f| &f.source).collect();
    let destinations: BTreeSet<&WorkloadIdentity> =
        flows.iter().map(|f| &f.destination).collect();

    IntervalSummary {
        flow_count: flows.len(),
        total_packets: flows
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(f.packet_count)),
        total_bytes: flows
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(f.byte_count)),
        unique_sources: sources.len(),
        unique_destinations: destinations.len(),
        unique_addresses: addresses.len(),
        unresolved_addresses: addresses
            .iter()
            .filter(|addr| !identify(**addr).is_resolved())
            .count(),
    }
}
