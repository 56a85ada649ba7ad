use super::record::AggregatedInterval;
use super::MetricsSink;
use crate::{NetInsightError, Result};
use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::debug;

const NAMESPACE: &str = "netinsight";

/// Sink that feeds every interval into a Prometheus registry
pub struct PrometheusSink {
    registry: Registry,
    traffic_bytes: IntCounterVec,
    traffic_packets: IntCounterVec,
    latency: HistogramVec,
    packet_size: HistogramVec,
    drops: IntCounterVec,
    protocol_packets: IntCounterVec,
    protocol_bytes: IntCounterVec,
    polls: IntCounterVec,
    missing_tables: IntCounterVec,
    resolver_hits: IntGauge,
    resolver_misses: IntGauge,
    resolver_queries: IntGauge,
    resolver_entries: IntGauge,
    connection_states: IntGaugeVec,
    pod_count: IntGaugeVec,
    service_count: IntGaugeVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let traffic_bytes = IntCounterVec::new(
            Opts::new(
                "network_traffic_bytes_total",
                "Bytes sent between workloads",
            )
            .namespace(NAMESPACE),
            &["source", "destination"],
        )?;
        let traffic_packets = IntCounterVec::new(
            Opts::new("network_packets_total", "Packets sent between workloads")
                .namespace(NAMESPACE),
            &["source", "destination"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "connection_latency_seconds",
                "Average per-interval latency between workloads",
            )
            .namespace(NAMESPACE)
            .buckets(exponential_buckets(0.0001, 2.0, 15)?),
            &["source", "destination"],
        )?;
        let packet_size = HistogramVec::new(
            HistogramOpts::new(
                "packet_size_bytes",
                "Average per-interval packet size between workloads",
            )
            .namespace(NAMESPACE)
            .buckets(exponential_buckets(64.0, 2.0, 10)?),
            &["source", "destination", "protocol"],
        )?;
        let drops = IntCounterVec::new(
            Opts::new("packet_drops_total", "Packets dropped by reason").namespace(NAMESPACE),
            &["reason"],
        )?;
        let protocol_packets = IntCounterVec::new(
            Opts::new("protocol_packets_total", "Packets by IP protocol").namespace(NAMESPACE),
            &["protocol"],
        )?;
        let protocol_bytes = IntCounterVec::new(
            Opts::new(
                "protocol_traffic_bytes_total",
                "Bytes between workloads by IP protocol",
            )
            .namespace(NAMESPACE),
            &["protocol", "source", "destination"],
        )?;
        let polls = IntCounterVec::new(
            Opts::new("polls_total", "Counter polls by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let missing_tables = IntCounterVec::new(
            Opts::new(
                "missing_tables_total",
                "Counter tables that could not be read",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let resolver_hits = IntGauge::with_opts(
            Opts::new("resolver_cache_hits", "Identity cache hits since start")
                .namespace(NAMESPACE),
        )?;
        let resolver_misses = IntGauge::with_opts(
            Opts::new("resolver_cache_misses", "Identity cache misses since start")
                .namespace(NAMESPACE),
        )?;
        let resolver_queries = IntGauge::with_opts(
            Opts::new(
                "resolver_directory_queries",
                "Cluster directory queries since start",
            )
            .namespace(NAMESPACE),
        )?;
        let resolver_entries = IntGauge::with_opts(
            Opts::new("resolver_cache_entries", "Entries in the identity cache")
                .namespace(NAMESPACE),
        )?;

        let connection_states = IntGaugeVec::new(
            Opts::new(
                "connection_states",
                "Packets per connection in the latest interval",
            )
            .namespace(NAMESPACE),
            &[
                "state",
                "source_ip",
                "destination_ip",
                "protocol",
                "source_port",
                "destination_port",
            ],
        )?;
        let pod_count = IntGaugeVec::new(
            Opts::new("pod_count", "Pods per namespace").namespace(NAMESPACE),
            &["namespace"],
        )?;
        let service_count = IntGaugeVec::new(
            Opts::new("service_count", "Services per namespace").namespace(NAMESPACE),
            &["namespace"],
        )?;

        registry.register(Box::new(traffic_bytes.clone()))?;
        registry.register(Box::new(traffic_packets.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(packet_size.clone()))?;
        registry.register(Box::new(drops.clone()))?;
        registry.register(Box::new(protocol_packets.clone()))?;
        registry.register(Box::new(protocol_bytes.clone()))?;
        registry.register(Box::new(polls.clone()))?;
        registry.register(Box::new(missing_tables.clone()))?;
        registry.register(Box::new(resolver_hits.clone()))?;
        registry.register(Box::new(resolver_misses.clone()))?;
        registry.register(Box::new(resolver_queries.clone()))?;
        registry.register(Box::new(resolver_entries.clone()))?;
        registry.register(Box::new(connection_states.clone()))?;
        registry.register(Box::new(pod_count.clone()))?;
        registry.register(Box::new(service_count.clone()))?;

        Ok(Self {
            registry,
            traffic_bytes,
            traffic_packets,
            latency,
            packet_size,
            drops,
            protocol_packets,
            protocol_bytes,
            polls,
            missing_tables,
            resolver_hits,
            resolver_misses,
            resolver_queries,
            resolver_entries,
            connection_states,
            pod_count,
            service_count,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the text exposition format
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

impl MetricsSink for PrometheusSink {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn ingest(&self, interval: &AggregatedInterval) -> Result<()> {
        for flow in &interval.flows {
            let source = flow.source.label();
            let destination = flow.destination.label();
            let protocol = flow.protocol_label();

            self.traffic_bytes
                .with_label_values(&[&source, &destination])
                .inc_by(flow.byte_count);
            self.traffic_packets
                .with_label_values(&[&source, &destination])
                .inc_by(flow.packet_count);
            self.protocol_bytes
                .with_label_values(&[&protocol, &source, &destination])
                .inc_by(flow.byte_count);

            if let Some(seconds) = flow.average_latency_seconds {
                self.latency
                    .with_label_values(&[&source, &destination])
                    .observe(seconds);
            }
            if let Some(size) = flow.bytes_per_packet {
                self.packet_size
                    .with_label_values(&[&source, &destination, &protocol])
                    .observe(size);
            }
        }

        for drop in interval.drops.entries() {
            self.drops
                .with_label_values(&[&drop.reason.to_string()])
                .inc_by(drop.count);
        }

        for entry in interval.protocols.entries() {
            self.protocol_packets
                .with_label_values(&[&entry.protocol.to_string()])
                .inc_by(entry.packets);
        }

        for table in &interval.missing_tables {
            self.missing_tables
                .with_label_values(&[table.as_str()])
                .inc();
        }

        // Gauges describe the latest interval only
        self.connection_states.reset();
        for conn in &interval.connections {
            let labels = [
                conn.state.to_string(),
                conn.source.to_string(),
                conn.destination.to_string(),
                conn.protocol.to_string(),
                conn.source_port.to_string(),
                conn.destination_port.to_string(),
            ];
            self.connection_states
                .with_label_values(&labels)
                .set(conn.packet_count as i64);
        }

        if let Some(inventory) = &interval.inventory {
            self.pod_count.reset();
            self.service_count.reset();
            for (namespace, counts) in inventory {
                self.pod_count
                    .with_label_values(&[namespace.as_str()])
                    .set(counts.pods as i64);
                self.service_count
                    .with_label_values(&[namespace.as_str()])
                    .set(counts.services as i64);
            }
        }

        let stats = &interval.resolver;
        self.resolver_hits.set(stats.cache_hits as i64);
        self.resolver_misses.set(stats.cache_misses as i64);
        self.resolver_queries.set(stats.directory_queries as i64);
        self.resolver_entries.set(stats.cached_entries as i64);

        self.polls.with_label_values(&["published"]).inc();
        debug!(flows = interval.flows.len(), "Exported interval");
        Ok(())
    }

    fn on_poll_skipped(&self, _reason: &str) {
        self.polls.with_label_values(&["skipped"]).inc();
    }
}

pub(crate) fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| NetInsightError::MetricsError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::{ConnectionTuple, RawCounterSnapshot};
    use crate::k8s::{NamespaceInventory, WorkloadIdentity, WorkloadInventory, WorkloadRef};
    use crate::metrics::aggregator::merge;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn interval() -> AggregatedInterval {
        let identities = HashMap::from([
            (A, WorkloadIdentity::pod(WorkloadRef::new("shop", "web-0"))),
            (B, WorkloadIdentity::service(WorkloadRef::new("shop", "api"))),
        ]);
        let snapshot = RawCounterSnapshot::builder()
            .packets(A, B, 10)
            .bytes(A, B, 1500)
            .latency(A, B, 500_000, 10)
            .drops(1, 5)
            .drops(99, 2)
            .protocol(6, 10)
            .connection(
                ConnectionTuple {
                    source: A,
                    destination: B,
                    source_port: 40000,
                    destination_port: 8080,
                    protocol: 6,
                },
                10,
            )
            .build();
        merge(&snapshot, &identities)
    }

    #[test]
    fn test_ingest_updates_counters() {
        let sink = PrometheusSink::new().unwrap();
        sink.ingest(&interval()).unwrap();
        sink.ingest(&interval()).unwrap();

        assert_eq!(
            sink.traffic_bytes
                .with_label_values(&["shop/web-0", "shop/api"])
                .get(),
            3000
        );
        assert_eq!(
            sink.drops.with_label_values(&["Unknown(99)"]).get(),
            4
        );
        assert_eq!(sink.polls.with_label_values(&["published"]).get(), 2);
    }

    #[test]
    fn test_encode_exposes_namespaced_metrics() {
        let sink = PrometheusSink::new().unwrap();
        sink.ingest(&interval()).unwrap();
        sink.on_poll_skipped("source unavailable");

        let text = sink.encode().unwrap();
        assert!(text.contains(
            "netinsight_network_packets_total{destination=\"shop/api\",source=\"shop/web-0\"} 10"
        ));
        assert!(text.contains("netinsight_packet_drops_total{reason=\"Generic drop\"} 5"));
        assert!(text.contains("netinsight_polls_total{outcome=\"skipped\"} 1"));
        assert!(text.contains("netinsight_connection_latency_seconds_bucket"));
    }

    #[test]
    fn test_connection_and_inventory_gauges_track_latest_interval() {
        let sink = PrometheusSink::new().unwrap();
        let mut first = interval();
        first.inventory = Some(WorkloadInventory::from([(
            "shop".to_string(),
            NamespaceInventory {
                pods: 3,
                services: 1,
            },
        )]));
        sink.ingest(&first).unwrap();

        let text = sink.encode().unwrap();
        assert!(text.contains(
            "netinsight_connection_states{destination_ip=\"10.0.0.2\",destination_port=\"8080\",\
             protocol=\"TCP\",source_ip=\"10.0.0.1\",source_port=\"40000\",state=\"ESTABLISHED\"} 10"
        ));
        assert!(text.contains("netinsight_pod_count{namespace=\"shop\"} 3"));
        assert!(text.contains("netinsight_service_count{namespace=\"shop\"} 1"));

        // No connections and no inventory: connection series go, counts stay
        let mut second = interval();
        second.connections.clear();
        sink.ingest(&second).unwrap();

        let text = sink.encode().unwrap();
        assert!(!text.contains("netinsight_connection_states{"));
        assert!(text.contains("netinsight_pod_count{namespace=\"shop\"} 3"));
    }
}
