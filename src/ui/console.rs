use crate::metrics::{AggregatedInterval, MetricsSink};
use crate::Result;
use std::fmt::Write;

const RULE_WIDTH: usize = 104;

/// Prints a table of every interval to stdout
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }

    pub fn render(interval: &AggregatedInterval) -> String {
        let mut out = String::new();
        let summary = &interval.summary;

        let _ = writeln!(
            out,
            "Interval at {}",
            humantime_serde::re::humantime::format_rfc3339_seconds(interval.taken_at)
        );

        if interval.flows.is_empty() {
            let _ = writeln!(out, "No flows observed.");
        } else {
            let _ = writeln!(
                out,
                "{:<30} {:<30} {:<12} {:>9} {:>9} {:>10}",
                "SOURCE", "DESTINATION", "PROTOCOL", "PACKETS", "BYTES", "LATENCY"
            );
            let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));

            for flow in &interval.flows {
                let latency = flow
                    .average_latency_seconds
                    .map(format_latency)
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    out,
                    "{:<30} {:<30} {:<12} {:>9} {:>9} {:>10}",
                    truncate(&flow.source.label(), 30),
                    truncate(&flow.destination.label(), 30),
                    flow.protocol_label(),
                    flow.packet_count,
                    format_bytes(flow.byte_count),
                    latency
                );
            }
        }

        if !interval.drops.is_empty() {
            let _ = writeln!(out, "\nDrops");
            for entry in interval.drops.entries() {
                let _ = writeln!(out, "  {:<24} {:>9}", entry.reason.to_string(), entry.count);
            }
        }

        if !interval.protocols.is_empty() {
            let _ = writeln!(out, "\nProtocols");
            for entry in interval.protocols.entries() {
                let _ = writeln!(
                    out,
                    "  {:<24} {:>9}",
                    entry.protocol.to_string(),
                    entry.packets
                );
            }
        }

        if !interval.missing_tables.is_empty() {
            let tables: Vec<&str> = interval.missing_tables.iter().map(|t| t.as_str()).collect();
            let _ = writeln!(out, "\nMissing tables: {}", tables.join(", "));
        }

        let _ = writeln!(out, "\n{}", "-".repeat(40));
        let _ = writeln!(out, "Flows:            {}", summary.flow_count);
        let _ = writeln!(out, "Packets:          {}", summary.total_packets);
        let _ = writeln!(out, "Bytes:            {}", format_bytes(summary.total_bytes));
        let _ = writeln!(out, "Sources:          {}", summary.unique_sources);
        let _ = writeln!(out, "Destinations:     {}", summary.unique_destinations);
        let _ = writeln!(
            out,
            "Unresolved:       {}/{}",
            summary.unresolved_addresses, summary.unique_addresses
        );

        out
    }
}

impl MetricsSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn ingest(&self, interval: &AggregatedInterval) -> Result<()> {
        println!("{}", Self::render(interval));
        Ok(())
    }

    fn on_poll_skipped(&self, reason: &str) {
        println!("Interval skipped: {}\n", reason);
    }
}

pub fn format_latency(seconds: f64) -> String {
    let nanos = seconds * 1e9;
    if nanos < 1_000.0 {
        format!("{:.0}ns", nanos)
    } else if nanos < 1_000_000.0 {
        format!("{:.1}µs", nanos / 1_000.0)
    } else if nanos < 1_000_000_000.0 {
        format!("{:.1}ms", nanos / 1_000_000.0)
    } else {
        format!("{:.2}s", seconds)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::RawCounterSnapshot;
    use crate::k8s::{WorkloadIdentity, WorkloadRef};
    use crate::metrics::aggregator::merge;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    #[test]
    fn test_format_latency_units() {
        assert_eq!(format_latency(0.000_000_5), "500ns");
        assert_eq!(format_latency(0.000_05), "50.0µs");
        assert_eq!(format_latency(0.0125), "12.5ms");
        assert_eq!(format_latency(2.5), "2.50s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0MB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("payments/checkout-7f9c", 12), "payments/...");
    }

    #[test]
    fn test_render_lists_flows_and_drops() {
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        let identities =
            HashMap::from([(a, WorkloadIdentity::pod(WorkloadRef::new("shop", "web-0")))]);
        let snapshot = RawCounterSnapshot::builder()
            .packets(a, b, 10)
            .bytes(a, b, 1500)
            .latency(a, b, 500_000, 10)
            .drops(2, 1)
            .build();

        let text = ConsoleSink::render(&merge(&snapshot, &identities));

        assert!(text.contains("shop/web-0"));
        assert!(text.contains("10.0.0.2"));
        assert!(text.contains("50.0µs"));
        assert!(text.contains("Invalid IP header"));
        assert!(text.contains("Unresolved:       1/2"));
    }
}
