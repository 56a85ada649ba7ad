//! Kernel counter source: loads the XDP program and reads its maps

use super::maps::{
    collect_rows, decode_protocol_slot, derive_paired_samples, CounterBaseline, Cumulative,
};
use super::snapshot::{AddressPair, ConnectionTuple, LatencyTotals, SnapshotBuilder};
use super::{CounterSource, RawCounterSnapshot, TableKind};
use crate::config::SourceConfig;
use crate::{NetInsightError, Result};
use async_trait::async_trait;
use aya::maps::{Array, HashMap as BpfHashMap, Map};
use aya::programs::{ProgramError, Xdp, XdpFlags};
use aya::{Ebpf, Pod};
use netinsight_common::{names, ConnKey, LatencyValue, PairKey};
use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MIN_KERNEL: (u32, u32) = (5, 8);

/// Per-table cumulative readings from the previous poll
#[derive(Default)]
struct Baselines {
    packets: CounterBaseline<AddressPair, u64>,
    bytes: CounterBaseline<AddressPair, u64>,
    latency: CounterBaseline<AddressPair, LatencyTotals>,
    drops: CounterBaseline<u32, u64>,
    protocols: CounterBaseline<u8, u64>,
    connections: CounterBaseline<ConnectionTuple, u64>,
}

struct AttachedProgram {
    bpf: Ebpf,
    baselines: Baselines,
}

/// Reads the counter maps of the attached XDP program.
///
/// The kernel counters only ever grow; each snapshot reports the growth since
/// the previous one so consecutive intervals never count a packet twice.
pub struct KernelCounterSource {
    config: SourceConfig,
    state: Mutex<Option<AttachedProgram>>,
}

impl KernelCounterSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Load the program from `object_path` and attach it to `interface`
    pub async fn attach(&self) -> Result<()> {
        run_preflight_checks()?;

        let path = &self.config.object_path;
        let iface = &self.config.interface;
        info!("Loading counter program from {}", path.display());

        let mut bpf = Ebpf::load_file(path).map_err(|e| {
            NetInsightError::ProgramLoadFailed(format!("{}: {}", path.display(), e))
        })?;

        let program: &mut Xdp = bpf
            .program_mut(names::PROGRAM)
            .ok_or_else(|| {
                NetInsightError::ProgramLoadFailed(format!(
                    "{} program not found in eBPF object",
                    names::PROGRAM
                ))
            })?
            .try_into()
            .map_err(|e: ProgramError| NetInsightError::ProgramLoadFailed(e.to_string()))?;

        program
            .load()
            .map_err(|e| NetInsightError::ProgramLoadFailed(e.to_string()))?;

        if let Err(e) = program.attach(iface, XdpFlags::default()) {
            warn!(
                "Native XDP attach on {} failed ({}), falling back to generic mode",
                iface, e
            );
            program
                .attach(iface, XdpFlags::SKB_MODE)
                .map_err(|e| NetInsightError::AttachFailed(format!("{}: {}", iface, e)))?;
        }

        info!("Counter program attached to {}", iface);

        *self.state.lock().await = Some(AttachedProgram {
            bpf,
            baselines: Baselines::default(),
        });
        Ok(())
    }

    /// Detach and unload the program. Later snapshots fail as unavailable.
    pub async fn detach(&self) {
        if let Some(attached) = self.state.lock().await.take() {
            info!("Detaching counter program from {}", self.config.interface);
            drop(attached);
            info!("Counter program unloaded");
        }
    }
}

#[async_trait]
impl CounterSource for KernelCounterSource {
    async fn snapshot(&self) -> Result<RawCounterSnapshot> {
        let mut guard = self.state.lock().await;
        let attached = guard.as_mut().ok_or_else(|| {
            NetInsightError::SourceUnavailable("counter program not attached".to_string())
        })?;
        let bpf = &attached.bpf;
        let baselines = &mut attached.baselines;

        // A table whose read fails keeps its old baseline, so its next good
        // read covers every interval since the last one.
        let mut failures = 0usize;
        let mut builder = RawCounterSnapshot::builder();

        let packets = refresh(
            TableKind::PacketCounts,
            &mut baselines.packets,
            read_table::<PairKey, u64>(bpf, TableKind::PacketCounts)
                .map(|rows| rows.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        );

        let latency = read_latency(bpf).and_then(|(rows, layout)| {
            let mut deltas = refresh(TableKind::LatencyTotals, &mut baselines.latency, Ok(rows))?;
            if layout == LatencyLayout::SumOnly {
                derive_paired_samples(&mut deltas, packets.as_ref().ok());
            }
            Ok(deltas)
        });

        builder = apply(
            builder,
            TableKind::PacketCounts,
            packets,
            SnapshotBuilder::packet_table,
            &mut failures,
        );
        builder = apply(
            builder,
            TableKind::LatencyTotals,
            latency,
            SnapshotBuilder::latency_table,
            &mut failures,
        );

        let bytes = refresh(
            TableKind::ByteCounts,
            &mut baselines.bytes,
            read_table::<PairKey, u64>(bpf, TableKind::ByteCounts)
                .map(|rows| rows.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        );
        builder = apply(
            builder,
            TableKind::ByteCounts,
            bytes,
            SnapshotBuilder::byte_table,
            &mut failures,
        );

        let drops = refresh(
            TableKind::DropCounts,
            &mut baselines.drops,
            read_table::<u32, u64>(bpf, TableKind::DropCounts),
        );
        builder = apply(
            builder,
            TableKind::DropCounts,
            drops,
            SnapshotBuilder::drop_table,
            &mut failures,
        );

        let protocols = refresh(
            TableKind::ProtocolCounts,
            &mut baselines.protocols,
            read_protocols(bpf),
        );
        builder = apply(
            builder,
            TableKind::ProtocolCounts,
            protocols,
            SnapshotBuilder::protocol_table,
            &mut failures,
        );

        let connections = refresh(
            TableKind::ConnectionTuples,
            &mut baselines.connections,
            read_table::<ConnKey, u64>(bpf, TableKind::ConnectionTuples)
                .map(|rows| rows.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        );
        builder = apply(
            builder,
            TableKind::ConnectionTuples,
            connections,
            SnapshotBuilder::connection_table,
            &mut failures,
        );

        if failures == TableKind::ALL.len() {
            return Err(NetInsightError::SourceUnavailable(
                "no counter table could be read".to_string(),
            ));
        }

        Ok(builder.build())
    }

    fn name(&self) -> &str {
        "kernel"
    }
}

fn table_error(table: TableKind, reason: impl std::fmt::Display) -> NetInsightError {
    NetInsightError::TableRead {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}

fn find_map(bpf: &Ebpf, table: TableKind) -> Result<&Map> {
    let name = table.map_name();
    bpf.map(name)
        .ok_or_else(|| table_error(table, format!("map {} not found", name)))
}

/// Read a whole hash map. Any entry error discards the table rather than
/// returning a partial one.
fn read_table<K: Pod, V: Pod>(bpf: &Ebpf, table: TableKind) -> Result<Vec<(K, V)>> {
    let hash_map = BpfHashMap::<_, K, V>::try_from(find_map(bpf, table)?)
        .map_err(|e| table_error(table, e))?;

    hash_map
        .iter()
        .map(|item| item.map_err(|e| table_error(table, e)))
        .collect()
}

/// Read every slot of an array map, keyed by slot index
fn read_array<V: Pod>(bpf: &Ebpf, table: TableKind) -> Result<Vec<(u32, V)>> {
    let array = Array::<_, V>::try_from(find_map(bpf, table)?).map_err(|e| table_error(table, e))?;

    array
        .iter()
        .enumerate()
        .map(|(slot, item)| {
            let value = item.map_err(|e| table_error(table, e))?;
            Ok((slot as u32, value))
        })
        .collect()
}

/// Protocol counts come from a TCP/UDP slot array, or from a hash map keyed
/// by protocol number
fn read_protocols(bpf: &Ebpf) -> Result<Vec<(u8, u64)>> {
    let table = TableKind::ProtocolCounts;
    match read_array::<u64>(bpf, table) {
        Ok(slots) => Ok(slots
            .into_iter()
            .filter_map(|(slot, packets)| decode_protocol_slot(slot, packets))
            .collect()),
        Err(array_err) => read_table::<u32, u64>(bpf, table)
            .map(|rows| {
                rows.into_iter()
                    .filter_map(|(k, v)| u8::try_from(k).ok().map(|p| (p, v)))
                    .collect()
            })
            .map_err(|_| array_err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatencyLayout {
    /// [`LatencyValue`]: sum and sample count
    Counted,
    /// Bare `u64` sum
    SumOnly,
}

fn read_latency(bpf: &Ebpf) -> Result<(Vec<(AddressPair, LatencyTotals)>, LatencyLayout)> {
    let table = TableKind::LatencyTotals;
    match read_table::<PairKey, LatencyValue>(bpf, table) {
        Ok(rows) => Ok((
            rows.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            LatencyLayout::Counted,
        )),
        Err(counted_err) => match read_table::<PairKey, u64>(bpf, table) {
            Ok(rows) => {
                debug!("Latency map holds bare sums, deriving samples from packet counts");
                Ok((
                    rows.into_iter()
                        .map(|(k, sum)| (k.into(), LatencyTotals::new(sum, 0)))
                        .collect(),
                    LatencyLayout::SumOnly,
                ))
            }
            Err(_) => Err(counted_err),
        },
    }
}

fn refresh<K, V>(
    table: TableKind,
    baseline: &mut CounterBaseline<K, V>,
    rows: Result<Vec<(K, V)>>,
) -> Result<HashMap<K, V>>
where
    K: Eq + Hash + Copy,
    V: Cumulative,
{
    let current = collect_rows(rows?);
    debug!(table = %table, entries = current.len(), "Read counter table");
    Ok(baseline.advance(current))
}

fn apply<T>(
    builder: SnapshotBuilder,
    table: TableKind,
    outcome: Result<T>,
    set: fn(SnapshotBuilder, T) -> SnapshotBuilder,
    failures: &mut usize,
) -> SnapshotBuilder {
    match outcome {
        Ok(rows) => set(builder, rows),
        Err(e) => {
            warn!(table = %table, error = %e, "Counter table unreadable, substituting empty table");
            *failures += 1;
            builder.missing(table)
        }
    }
}

/// Validate the system can run the counter program before loading it
fn run_preflight_checks() -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version()?;
    check_btf();
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

fn check_kernel_version() -> Result<()> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")?;
    let release = release.trim();

    let Some((major, minor)) = parse_kernel_version(release) else {
        warn!("Could not parse kernel version {:?}, continuing", release);
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL {
        return Err(NetInsightError::KernelVersionTooOld {
            version: release.to_string(),
            min_version: format!("{}.{}", MIN_KERNEL.0, MIN_KERNEL.1),
        });
    }

    info!("Kernel version: {} (supported)", release);
    Ok(())
}

fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_btf() {
    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not found at /sys/kernel/btf/vmlinux");
        return;
    }
    info!("BTF available");
}

fn check_capabilities() {
    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!(
            "Not running as root (euid={}). Ensure CAP_BPF and CAP_NET_ADMIN are granted.",
            euid
        );
    } else {
        info!("Running with root privileges");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("6.8.0-45-generic"), Some((6, 8)));
        assert_eq!(parse_kernel_version("5.15.153.1-microsoft"), Some((5, 15)));
        assert_eq!(parse_kernel_version("garbage"), None);
    }

    #[test]
    fn test_failed_table_is_substituted_and_counted() {
        let a = std::net::Ipv4Addr::new(10, 0, 0, 1);
        let b = std::net::Ipv4Addr::new(10, 0, 0, 2);
        let mut failures = 0;

        let builder = apply(
            RawCounterSnapshot::builder().bytes(a, b, 512),
            TableKind::PacketCounts,
            Ok(HashMap::from([(AddressPair::new(a, b), 4)])),
            SnapshotBuilder::packet_table,
            &mut failures,
        );
        let builder = apply(
            builder,
            TableKind::ByteCounts,
            Err(table_error(TableKind::ByteCounts, "Invalid map type")),
            SnapshotBuilder::byte_table,
            &mut failures,
        );
        let snapshot = builder.build();

        assert_eq!(failures, 1);
        assert_eq!(snapshot.missing_tables(), &[TableKind::ByteCounts]);
        assert!(snapshot.byte_counts().is_empty());
        assert_eq!(snapshot.packet_counts()[&AddressPair::new(a, b)], 4);
    }

    #[tokio::test]
    async fn test_snapshot_before_attach_is_unavailable() {
        let source = KernelCounterSource::new(SourceConfig::default());
        assert!(matches!(
            source.snapshot().await,
            Err(NetInsightError::SourceUnavailable(_))
        ));
    }
}
