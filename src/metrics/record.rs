//! Aggregated output of one polling interval

use crate::ebpf::{ConnectionTuple, LatencyTotals, Protocol, TableKind};
use crate::k8s::{ResolverStats, WorkloadIdentity, WorkloadInventory};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::SystemTime;

/// Traffic between two workloads over one interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    pub source: WorkloadIdentity,
    pub destination: WorkloadIdentity,
    /// `None` when no connection tuple matched the pair
    pub protocol: Option<Protocol>,
    pub packet_count: u64,
    pub byte_count: u64,
    pub latency: LatencyTotals,
    pub average_latency_seconds: Option<f64>,
    pub bytes_per_packet: Option<f64>,
}

impl FlowRecord {
    pub fn protocol_label(&self) -> String {
        match self.protocol {
            Some(protocol) => protocol.to_string(),
            None => "Unknown".to_string(),
        }
    }
}

/// Connection state as far as packet counters can tell. TCP tuples that
/// carried packets count as established, anything else as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionState {
    Established,
    Active,
}

impl ConnectionState {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => ConnectionState::Established,
            _ => ConnectionState::Active,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Active => "ACTIVE",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Packets seen on one 5-tuple over one interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub state: ConnectionState,
    pub packet_count: u64,
}

impl ConnectionRecord {
    pub fn new(tuple: &ConnectionTuple, packet_count: u64) -> Self {
        let protocol = Protocol::from_number(tuple.protocol);
        Self {
            source: tuple.source,
            destination: tuple.destination,
            source_port: tuple.source_port,
            destination_port: tuple.destination_port,
            protocol,
            state: ConnectionState::for_protocol(protocol),
            packet_count,
        }
    }
}

/// Why the kernel program dropped a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Generic,
    InvalidIpHeader,
    TcpChecksum,
    UdpChecksum,
    Unknown(u32),
}

impl DropReason {
    pub const fn from_code(code: u32) -> Self {
        use netinsight_common::drop_reason::*;
        match code {
            GENERIC => DropReason::Generic,
            INVALID_IP_HEADER => DropReason::InvalidIpHeader,
            TCP_CHECKSUM => DropReason::TcpChecksum,
            UDP_CHECKSUM => DropReason::UdpChecksum,
            other => DropReason::Unknown(other),
        }
    }

    pub const fn code(&self) -> u32 {
        use netinsight_common::drop_reason::*;
        match self {
            DropReason::Generic => GENERIC,
            DropReason::InvalidIpHeader => INVALID_IP_HEADER,
            DropReason::TcpChecksum => TCP_CHECKSUM,
            DropReason::UdpChecksum => UDP_CHECKSUM,
            DropReason::Unknown(code) => *code,
        }
    }
}

impl Ord for DropReason {
    fn cmp(&self, other: &Self) -> Ordering {
        self.code().cmp(&other.code())
    }
}

impl PartialOrd for DropReason {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Generic => write!(f, "Generic drop"),
            DropReason::InvalidIpHeader => write!(f, "Invalid IP header"),
            DropReason::TcpChecksum => write!(f, "TCP checksum error"),
            DropReason::UdpChecksum => write!(f, "UDP checksum error"),
            DropReason::Unknown(code) => write!(f, "Unknown({})", code),
        }
    }
}

impl Serialize for DropReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DropCount {
    pub reason: DropReason,
    pub count: u64,
}

/// Drop counts by reason, ordered by reason code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DropBreakdown {
    entries: Vec<DropCount>,
}

impl DropBreakdown {
    pub fn from_counts(counts: &HashMap<u32, u64>) -> Self {
        let mut entries: Vec<DropCount> = counts
            .iter()
            .map(|(&code, &count)| DropCount {
                reason: DropReason::from_code(code),
                count,
            })
            .collect();
        entries.sort_by_key(|entry| entry.reason);
        Self { entries }
    }

    pub fn entries(&self) -> &[DropCount] {
        &self.entries
    }

    pub fn get(&self, reason: DropReason) -> Option<u64> {
        self.entries
            .iter()
            .find(|entry| entry.reason == reason)
            .map(|entry| entry.count)
    }

    pub fn total(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |acc, entry| acc.saturating_add(entry.count))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProtocolCount {
    pub protocol: Protocol,
    pub packets: u64,
}

/// Packets by IP protocol, ordered by protocol number
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProtocolBreakdown {
    entries: Vec<ProtocolCount>,
}

impl ProtocolBreakdown {
    pub fn from_counts(counts: &HashMap<u8, u64>) -> Self {
        let mut entries: Vec<ProtocolCount> = counts
            .iter()
            .map(|(&number, &packets)| ProtocolCount {
                protocol: Protocol::from_number(number),
                packets,
            })
            .collect();
        entries.sort_by_key(|entry| entry.protocol);
        Self { entries }
    }

    pub fn entries(&self) -> &[ProtocolCount] {
        &self.entries
    }

    pub fn get(&self, protocol: Protocol) -> Option<u64> {
        self.entries
            .iter()
            .find(|entry| entry.protocol == protocol)
            .map(|entry| entry.packets)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Interval-wide totals over the flow records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntervalSummary {
    pub flow_count: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub unique_sources: usize,
    pub unique_destinations: usize,
    /// Distinct raw addresses seen in packet or byte counts
    pub unique_addresses: usize,
    pub unresolved_addresses: usize,
}

/// Everything produced from one snapshot
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedInterval {
    #[serde(with = "humantime_serde")]
    pub taken_at: SystemTime,
    pub flows: Vec<FlowRecord>,
    /// Every connection tuple that moved, ordered by tuple
    pub connections: Vec<ConnectionRecord>,
    pub drops: DropBreakdown,
    pub protocols: ProtocolBreakdown,
    pub summary: IntervalSummary,
    pub missing_tables: Vec<TableKind>,
    pub resolver: ResolverStats,
    /// Workloads per namespace, absent when the directory could not list them
    pub inventory: Option<WorkloadInventory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_breakdown_names_and_order() {
        let drops = DropBreakdown::from_counts(&HashMap::from([(99, 2), (1, 5), (3, 1)]));

        let rendered: Vec<_> = drops
            .entries()
            .iter()
            .map(|entry| (entry.reason.to_string(), entry.count))
            .collect();
        assert_eq!(
            rendered,
            vec![
                ("Generic drop".to_string(), 5),
                ("TCP checksum error".to_string(), 1),
                ("Unknown(99)".to_string(), 2),
            ]
        );
        assert_eq!(drops.total(), 8);
        assert_eq!(drops.get(DropReason::Unknown(99)), Some(2));
    }

    #[test]
    fn test_drop_reason_codes_round_trip() {
        for code in 0..6 {
            assert_eq!(DropReason::from_code(code).code(), code);
        }
        assert_eq!(DropReason::from_code(2).to_string(), "Invalid IP header");
        assert_eq!(DropReason::from_code(4).to_string(), "UDP checksum error");
    }

    #[test]
    fn test_connection_state_follows_protocol() {
        let tuple = ConnectionTuple {
            source: Ipv4Addr::new(10, 0, 0, 1),
            destination: Ipv4Addr::new(10, 0, 0, 2),
            source_port: 40000,
            destination_port: 53,
            protocol: 17,
        };
        let udp = ConnectionRecord::new(&tuple, 4);
        assert_eq!(udp.protocol, Protocol::Udp);
        assert_eq!(udp.state.to_string(), "ACTIVE");

        let tcp = ConnectionRecord::new(&ConnectionTuple { protocol: 6, ..tuple }, 4);
        assert_eq!(tcp.state, ConnectionState::Established);
    }

    #[test]
    fn test_protocol_breakdown() {
        let protocols = ProtocolBreakdown::from_counts(&HashMap::from([(17, 4), (6, 10), (1, 2)]));

        let order: Vec<_> = protocols
            .entries()
            .iter()
            .map(|entry| entry.protocol.to_string())
            .collect();
        assert_eq!(order, vec!["ICMP", "TCP", "UDP"]);
        assert_eq!(protocols.get(Protocol::Tcp), Some(10));
    }
}
