//! Immutable per-poll view of the kernel counter tables

use super::TableKind;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::SystemTime;

/// Directed (source, destination) address pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AddressPair {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl AddressPair {
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// 5-tuple key of the connection table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionTuple {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol: u8,
}

impl ConnectionTuple {
    pub fn pair(&self) -> AddressPair {
        AddressPair::new(self.source, self.destination)
    }
}

/// Latency kept as an exact nanosecond sum plus the number of samples in it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyTotals {
    pub sum_ns: u64,
    pub samples: u64,
}

impl LatencyTotals {
    pub fn new(sum_ns: u64, samples: u64) -> Self {
        Self { sum_ns, samples }
    }

    /// Mean latency in nanoseconds, absent when nothing was sampled
    pub fn average_ns(&self) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }
        Some(self.sum_ns as f64 / self.samples as f64)
    }

    pub fn merge(&mut self, other: LatencyTotals) {
        self.sum_ns = self.sum_ns.saturating_add(other.sum_ns);
        self.samples = self.samples.saturating_add(other.samples);
    }
}

/// IP protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    pub const fn from_number(number: u8) -> Self {
        match number {
            netinsight_common::protocol::TCP => Protocol::Tcp,
            netinsight_common::protocol::UDP => Protocol::Udp,
            netinsight_common::protocol::ICMP => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }

    pub const fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => netinsight_common::protocol::TCP,
            Protocol::Udp => netinsight_common::protocol::UDP,
            Protocol::Icmp => netinsight_common::protocol::ICMP,
            Protocol::Other(n) => *n,
        }
    }
}

impl From<u8> for Protocol {
    fn from(number: u8) -> Self {
        Protocol::from_number(number)
    }
}

impl Ord for Protocol {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number().cmp(&other.number())
    }
}

impl PartialOrd for Protocol {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Other(proto) => write!(f, "Protocol({})", proto),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One read of every counter table, all covering the same polling interval.
///
/// Tables that failed to read are present but empty, and listed in
/// [`RawCounterSnapshot::missing_tables`].
#[derive(Debug, Clone)]
pub struct RawCounterSnapshot {
    packet_counts: HashMap<AddressPair, u64>,
    byte_counts: HashMap<AddressPair, u64>,
    latency_totals: HashMap<AddressPair, LatencyTotals>,
    drop_counts: HashMap<u32, u64>,
    protocol_counts: HashMap<u8, u64>,
    connection_tuples: HashMap<ConnectionTuple, u64>,
    missing_tables: Vec<TableKind>,
    taken_at: SystemTime,
}

impl RawCounterSnapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    pub fn packet_counts(&self) -> &HashMap<AddressPair, u64> {
        &self.packet_counts
    }

    pub fn byte_counts(&self) -> &HashMap<AddressPair, u64> {
        &self.byte_counts
    }

    pub fn latency_totals(&self) -> &HashMap<AddressPair, LatencyTotals> {
        &self.latency_totals
    }

    pub fn drop_counts(&self) -> &HashMap<u32, u64> {
        &self.drop_counts
    }

    pub fn protocol_counts(&self) -> &HashMap<u8, u64> {
        &self.protocol_counts
    }

    pub fn connection_tuples(&self) -> &HashMap<ConnectionTuple, u64> {
        &self.connection_tuples
    }

    pub fn missing_tables(&self) -> &[TableKind] {
        &self.missing_tables
    }

    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }

    pub fn is_empty(&self) -> bool {
        self.packet_counts.is_empty()
            && self.byte_counts.is_empty()
            && self.latency_totals.is_empty()
            && self.drop_counts.is_empty()
            && self.protocol_counts.is_empty()
            && self.connection_tuples.is_empty()
    }
}

/// Assembles a [`RawCounterSnapshot`]; repeated keys are summed
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    packet_counts: HashMap<AddressPair, u64>,
    byte_counts: HashMap<AddressPair, u64>,
    latency_totals: HashMap<AddressPair, LatencyTotals>,
    drop_counts: HashMap<u32, u64>,
    protocol_counts: HashMap<u8, u64>,
    connection_tuples: HashMap<ConnectionTuple, u64>,
    missing_tables: Vec<TableKind>,
    taken_at: Option<SystemTime>,
}

impl SnapshotBuilder {
    pub fn packets(mut self, source: Ipv4Addr, destination: Ipv4Addr, count: u64) -> Self {
        add(
            &mut self.packet_counts,
            AddressPair::new(source, destination),
            count,
        );
        self
    }

    pub fn bytes(mut self, source: Ipv4Addr, destination: Ipv4Addr, count: u64) -> Self {
        add(
            &mut self.byte_counts,
            AddressPair::new(source, destination),
            count,
        );
        self
    }

    pub fn latency(
        mut self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        sum_ns: u64,
        samples: u64,
    ) -> Self {
        self.latency_totals
            .entry(AddressPair::new(source, destination))
            .or_default()
            .merge(LatencyTotals::new(sum_ns, samples));
        self
    }

    pub fn drops(mut self, reason: u32, count: u64) -> Self {
        add(&mut self.drop_counts, reason, count);
        self
    }

    pub fn protocol(mut self, protocol: u8, count: u64) -> Self {
        add(&mut self.protocol_counts, protocol, count);
        self
    }

    pub fn connection(mut self, tuple: ConnectionTuple, count: u64) -> Self {
        add(&mut self.connection_tuples, tuple, count);
        self
    }

    pub fn packet_table(mut self, table: HashMap<AddressPair, u64>) -> Self {
        self.packet_counts = table;
        self
    }

    pub fn byte_table(mut self, table: HashMap<AddressPair, u64>) -> Self {
        self.byte_counts = table;
        self
    }

    pub fn latency_table(mut self, table: HashMap<AddressPair, LatencyTotals>) -> Self {
        self.latency_totals = table;
        self
    }

    pub fn drop_table(mut self, table: HashMap<u32, u64>) -> Self {
        self.drop_counts = table;
        self
    }

    pub fn protocol_table(mut self, table: HashMap<u8, u64>) -> Self {
        self.protocol_counts = table;
        self
    }

    pub fn connection_table(mut self, table: HashMap<ConnectionTuple, u64>) -> Self {
        self.connection_tuples = table;
        self
    }

    /// Record a table that could not be read; its contents are cleared.
    pub fn missing(mut self, table: TableKind) -> Self {
        match table {
            TableKind::PacketCounts => self.packet_counts.clear(),
            TableKind::ByteCounts => self.byte_counts.clear(),
            TableKind::LatencyTotals => self.latency_totals.clear(),
            TableKind::DropCounts => self.drop_counts.clear(),
            TableKind::ProtocolCounts => self.protocol_counts.clear(),
            TableKind::ConnectionTuples => self.connection_tuples.clear(),
        }
        if !self.missing_tables.contains(&table) {
            self.missing_tables.push(table);
        }
        self
    }

    pub fn taken_at(mut self, at: SystemTime) -> Self {
        self.taken_at = Some(at);
        self
    }

    pub fn build(self) -> RawCounterSnapshot {
        RawCounterSnapshot {
            packet_counts: self.packet_counts,
            byte_counts: self.byte_counts,
            latency_totals: self.latency_totals,
            drop_counts: self.drop_counts,
            protocol_counts: self.protocol_counts,
            connection_tuples: self.connection_tuples,
            missing_tables: self.missing_tables,
            taken_at: self.taken_at.unwrap_or_else(SystemTime::now),
        }
    }
}

fn add<K: std::hash::Hash + Eq>(table: &mut HashMap<K, u64>, key: K, count: u64) {
    let slot = table.entry(key).or_insert(0);
    *slot = slot.saturating_add(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn test_average_latency_absent_without_samples() {
        assert_eq!(LatencyTotals::new(1234, 0).average_ns(), None);
        assert_eq!(LatencyTotals::new(500_000, 10).average_ns(), Some(50_000.0));
    }

    #[test]
    fn test_builder_sums_repeated_keys() {
        let snapshot = RawCounterSnapshot::builder()
            .packets(A, B, 3)
            .packets(A, B, 4)
            .latency(A, B, 100, 1)
            .latency(A, B, 300, 2)
            .build();

        assert_eq!(snapshot.packet_counts()[&AddressPair::new(A, B)], 7);
        assert_eq!(
            snapshot.latency_totals()[&AddressPair::new(A, B)],
            LatencyTotals::new(400, 3)
        );
    }

    #[test]
    fn test_missing_table_is_empty_and_listed_once() {
        let snapshot = RawCounterSnapshot::builder()
            .bytes(A, B, 100)
            .missing(TableKind::ByteCounts)
            .missing(TableKind::ByteCounts)
            .build();

        assert!(snapshot.byte_counts().is_empty());
        assert_eq!(snapshot.missing_tables(), &[TableKind::ByteCounts]);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_protocol_display_and_order() {
        assert_eq!(Protocol::from(6).to_string(), "TCP");
        assert_eq!(Protocol::from(17).to_string(), "UDP");
        assert_eq!(Protocol::from(47).to_string(), "Protocol(47)");
        assert!(Protocol::Icmp < Protocol::Tcp);
        assert!(Protocol::Tcp < Protocol::Udp);
    }
}
