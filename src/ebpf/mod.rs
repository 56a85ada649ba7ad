#[cfg(target_os = "linux")]
pub mod loader;
pub mod maps;
pub mod replay;
pub mod snapshot;

#[cfg(target_os = "linux")]
pub use loader::KernelCounterSource;
pub use replay::ReplayCounterSource;
pub use snapshot::{
    AddressPair, ConnectionTuple, LatencyTotals, Protocol, RawCounterSnapshot, SnapshotBuilder,
};

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Source of per-interval counter snapshots.
///
/// `snapshot` fails with [`crate::NetInsightError::SourceUnavailable`] only when
/// nothing could be read. A table that fails on its own is reported through
/// [`RawCounterSnapshot::missing_tables`] and arrives empty.
#[async_trait]
pub trait CounterSource: Send + Sync {
    async fn snapshot(&self) -> Result<RawCounterSnapshot>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    PacketCounts,
    ByteCounts,
    LatencyTotals,
    DropCounts,
    ProtocolCounts,
    ConnectionTuples,
}

impl TableKind {
    pub const ALL: [TableKind; 6] = [
        TableKind::PacketCounts,
        TableKind::ByteCounts,
        TableKind::LatencyTotals,
        TableKind::DropCounts,
        TableKind::ProtocolCounts,
        TableKind::ConnectionTuples,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            TableKind::PacketCounts => "packet_counts",
            TableKind::ByteCounts => "byte_counts",
            TableKind::LatencyTotals => "latency_totals",
            TableKind::DropCounts => "drop_counts",
            TableKind::ProtocolCounts => "protocol_counts",
            TableKind::ConnectionTuples => "connection_tuples",
        }
    }

    /// Name of the kernel map backing this table
    pub const fn map_name(&self) -> &'static str {
        use netinsight_common::names;
        match self {
            TableKind::PacketCounts => names::PACKET_COUNT,
            TableKind::ByteCounts => names::PACKET_SIZE,
            TableKind::LatencyTotals => names::LATENCY,
            TableKind::DropCounts => names::DROPS,
            TableKind::ProtocolCounts => names::PROTOCOL_COUNT,
            TableKind::ConnectionTuples => names::CONNECTIONS,
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
