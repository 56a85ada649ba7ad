//! Decoding of kernel map entries and cumulative-to-interval conversion
//!
//! The XDP program stores `iphdr` addresses and transport ports verbatim, so
//! the in-memory bytes of every loaded key are in network order. Decoding goes
//! through `to_ne_bytes()`, which hands back those bytes untouched regardless
//! of host endianness.

use super::snapshot::{AddressPair, ConnectionTuple, LatencyTotals};
use netinsight_common::{protocol, ConnKey, LatencyValue, PairKey};
use std::collections::HashMap;
use std::hash::Hash;
use std::net::Ipv4Addr;

pub fn decode_addr(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

pub fn decode_port(raw: u16) -> u16 {
    u16::from_be_bytes(raw.to_ne_bytes())
}

impl From<PairKey> for AddressPair {
    fn from(key: PairKey) -> Self {
        AddressPair::new(decode_addr(key.src_ip), decode_addr(key.dst_ip))
    }
}

impl From<ConnKey> for ConnectionTuple {
    fn from(key: ConnKey) -> Self {
        ConnectionTuple {
            source: decode_addr(key.src_ip),
            destination: decode_addr(key.dst_ip),
            source_port: decode_port(key.src_port),
            destination_port: decode_port(key.dst_port),
            protocol: key.protocol,
        }
    }
}

impl From<LatencyValue> for LatencyTotals {
    fn from(value: LatencyValue) -> Self {
        LatencyTotals::new(value.total_ns, value.samples)
    }
}

/// Decode one `protocol_count` array slot. Unknown slots are skipped.
pub fn decode_protocol_slot(slot: u32, packets: u64) -> Option<(u8, u64)> {
    protocol::from_slot(slot).map(|number| (number, packets))
}

/// Fill in sample counts for latency read from a sum-only map, where one
/// sample is taken per two packets of the pair. Pairs without a packet
/// count keep zero samples and so report no average.
pub fn derive_paired_samples(
    latency: &mut HashMap<AddressPair, LatencyTotals>,
    packets: Option<&HashMap<AddressPair, u64>>,
) {
    for (pair, totals) in latency.iter_mut() {
        totals.samples = packets
            .and_then(|packets| packets.get(pair))
            .map_or(0, |count| count / 2);
    }
}

/// A monotonically growing kernel counter value
pub trait Cumulative: Copy + Default {
    /// Growth since `previous`. A value below `previous` means the map entry
    /// was reset, so the whole current value counts as new.
    fn since(&self, previous: &Self) -> Self;

    fn accumulate(&mut self, other: Self);

    fn is_zero(&self) -> bool;
}

impl Cumulative for u64 {
    fn since(&self, previous: &Self) -> Self {
        if self >= previous {
            self - previous
        } else {
            *self
        }
    }

    fn accumulate(&mut self, other: Self) {
        *self = self.saturating_add(other);
    }

    fn is_zero(&self) -> bool {
        *self == 0
    }
}

impl Cumulative for LatencyTotals {
    fn since(&self, previous: &Self) -> Self {
        if self.sum_ns >= previous.sum_ns && self.samples >= previous.samples {
            LatencyTotals::new(self.sum_ns - previous.sum_ns, self.samples - previous.samples)
        } else {
            *self
        }
    }

    fn accumulate(&mut self, other: Self) {
        self.merge(other);
    }

    fn is_zero(&self) -> bool {
        self.sum_ns == 0 && self.samples == 0
    }
}

/// Last cumulative reading of one table, used to turn the next reading into
/// per-interval deltas
#[derive(Debug)]
pub struct CounterBaseline<K, V> {
    previous: HashMap<K, V>,
}

impl<K, V> CounterBaseline<K, V>
where
    K: Eq + Hash + Copy,
    V: Cumulative,
{
    pub fn new() -> Self {
        Self {
            previous: HashMap::new(),
        }
    }

    /// Replace the baseline with `current` and return what changed since the
    /// last reading. Entries that did not move are left out.
    pub fn advance(&mut self, current: HashMap<K, V>) -> HashMap<K, V> {
        let mut deltas = HashMap::with_capacity(current.len());

        for (key, value) in &current {
            let delta = match self.previous.get(key) {
                Some(previous) => value.since(previous),
                None => *value,
            };
            if !delta.is_zero() {
                deltas.insert(*key, delta);
            }
        }

        self.previous = current;
        deltas
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

impl<K, V> Default for CounterBaseline<K, V>
where
    K: Eq + Hash + Copy,
    V: Cumulative,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Collect decoded rows into a table, summing rows that decode to the same key
pub fn collect_rows<K, V, I>(rows: I) -> HashMap<K, V>
where
    K: Eq + Hash,
    V: Cumulative,
    I: IntoIterator<Item = (K, V)>,
{
    let mut table: HashMap<K, V> = HashMap::new();
    for (key, value) in rows {
        table.entry(key).or_default().accumulate(value);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_addr_keeps_wire_octets() {
        let raw = u32::from_ne_bytes([10, 0, 0, 5]);
        assert_eq!(decode_addr(raw), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_decode_port_from_network_order() {
        let raw = u16::from_ne_bytes(8080u16.to_be_bytes());
        assert_eq!(decode_port(raw), 8080);
    }

    #[test]
    fn test_conn_key_conversion() {
        let key = ConnKey {
            src_ip: u32::from_ne_bytes([192, 168, 1, 10]),
            dst_ip: u32::from_ne_bytes([10, 96, 0, 1]),
            src_port: u16::from_ne_bytes(40000u16.to_be_bytes()),
            dst_port: u16::from_ne_bytes(443u16.to_be_bytes()),
            protocol: 6,
            _padding: [0; 3],
        };

        let tuple = ConnectionTuple::from(key);
        assert_eq!(tuple.source, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(tuple.destination, Ipv4Addr::new(10, 96, 0, 1));
        assert_eq!(tuple.source_port, 40000);
        assert_eq!(tuple.destination_port, 443);
        assert_eq!(tuple.protocol, 6);
    }

    #[test]
    fn test_protocol_slots_map_to_protocol_numbers() {
        assert_eq!(decode_protocol_slot(0, 12), Some((6, 12)));
        assert_eq!(decode_protocol_slot(1, 3), Some((17, 3)));
        assert_eq!(decode_protocol_slot(2, 1), None);
    }

    #[test]
    fn test_paired_samples_follow_packet_counts() {
        let ab = AddressPair::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        let cd = AddressPair::new(Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 4));
        let mut latency = HashMap::from([
            (ab, LatencyTotals::new(9_000, 0)),
            (cd, LatencyTotals::new(500, 0)),
        ]);

        derive_paired_samples(&mut latency, Some(&HashMap::from([(ab, 7)])));
        assert_eq!(latency[&ab], LatencyTotals::new(9_000, 3));
        assert_eq!(latency[&cd].average_ns(), None);

        derive_paired_samples(&mut latency, None);
        assert_eq!(latency[&ab].samples, 0);
    }

    #[test]
    fn test_baseline_reports_growth_only() {
        let mut baseline: CounterBaseline<u32, u64> = CounterBaseline::new();

        let first = baseline.advance(HashMap::from([(1, 10), (2, 5)]));
        assert_eq!(first, HashMap::from([(1, 10), (2, 5)]));

        let second = baseline.advance(HashMap::from([(1, 15), (2, 5), (3, 1)]));
        assert_eq!(second, HashMap::from([(1, 5), (3, 1)]));
    }

    #[test]
    fn test_baseline_treats_decrease_as_reset() {
        let mut baseline: CounterBaseline<u32, u64> = CounterBaseline::new();
        baseline.advance(HashMap::from([(1, 100)]));

        let after_reset = baseline.advance(HashMap::from([(1, 7)]));
        assert_eq!(after_reset, HashMap::from([(1, 7)]));
    }

    #[test]
    fn test_latency_baseline() {
        let mut baseline: CounterBaseline<u32, LatencyTotals> = CounterBaseline::new();
        baseline.advance(HashMap::from([(1, LatencyTotals::new(1_000, 4))]));

        let delta = baseline.advance(HashMap::from([(1, LatencyTotals::new(1_600, 6))]));
        assert_eq!(delta[&1], LatencyTotals::new(600, 2));
        assert_eq!(baseline.len(), 1);
    }

    #[test]
    fn test_collect_rows_sums_duplicates() {
        let table = collect_rows(vec![(1u8, 2u64), (1, 3), (2, 1)]);
        assert_eq!(table, HashMap::from([(1, 5), (2, 1)]));
    }
}
