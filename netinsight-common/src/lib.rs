//! Counter table layouts shared between the kernel program and userspace
//!
//! Every key and value here mirrors a map in the XDP program and must be:
//! - `#[repr(C)]` with explicit padding so the layout is stable
//! - `no_std` compatible
//! - byte-for-byte identical to the kernel-side struct
//!
//! Addresses and ports are stored exactly as they appear in the packet
//! headers (network byte order). Userspace decodes them from the in-memory
//! bytes of the loaded value, which is independent of host endianness.

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Key of the per address-pair tables (`packet_count`, `packet_size`, `latency_map`)
///
/// Layout (8 bytes, 4-byte aligned):
/// - src_ip: `iphdr->saddr` verbatim
/// - dst_ip: `iphdr->daddr` verbatim
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq, Hash))]
pub struct PairKey {
    pub src_ip: u32,
    pub dst_ip: u32,
}

/// Value of `latency_map`: nanosecond sum plus the number of samples in it
///
/// Layout (16 bytes, 8-byte aligned). Programs that store only the sum keep
/// a bare `u64` here instead. Such a program takes one sample for every two
/// packets of a pair (the first stamps a start time, the second measures),
/// so userspace derives the sample count from the pair's packet count.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct LatencyValue {
    pub total_ns: u64,
    pub samples: u64,
}

/// Key of `connection_map`
///
/// Layout (16 bytes, 4-byte aligned):
/// - src_ip / dst_ip: network byte order, as in [`PairKey`]
/// - src_port / dst_port: network byte order (`tcphdr->source` verbatim)
/// - protocol: IP protocol number (6=TCP, 17=UDP, 1=ICMP)
/// - _padding: keeps the struct at 16 bytes on both sides
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq, Hash))]
pub struct ConnKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub _padding: [u8; 3],
}

/// Names of the maps and program inside the compiled object
pub mod names {
    pub const PROGRAM: &str = "monitor_packets";
    pub const PACKET_COUNT: &str = "packet_count";
    pub const PACKET_SIZE: &str = "packet_size";
    pub const LATENCY: &str = "latency_map";
    pub const DROPS: &str = "drop_map";
    pub const PROTOCOL_COUNT: &str = "protocol_count";
    pub const CONNECTIONS: &str = "connection_map";
}

/// IP protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;

    /// Protocol number counted in a `protocol_count` slot. That map is an
    /// array indexed by slot, not by protocol number: slot 0 counts TCP
    /// packets and slot 1 UDP packets.
    pub const fn from_slot(slot: u32) -> Option<u8> {
        match slot {
            0 => Some(TCP),
            1 => Some(UDP),
            _ => None,
        }
    }
}

/// Drop reason codes written to `drop_map`
pub mod drop_reason {
    pub const GENERIC: u32 = 1;
    pub const INVALID_IP_HEADER: u32 = 2;
    pub const TCP_CHECKSUM: u32 = 3;
    pub const UDP_CHECKSUM: u32 = 4;
}

#[cfg(all(feature = "userspace", target_os = "linux"))]
mod pod_impls {
    // SAFETY: all three types are repr(C), Copy, and fully initialized
    // (padding is an explicit field).
    unsafe impl aya::Pod for super::PairKey {}
    unsafe impl aya::Pod for super::LatencyValue {}
    unsafe impl aya::Pod for super::ConnKey {}
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<PairKey>() == 8,
        "PairKey must be exactly 8 bytes"
    );
    assert!(
        core::mem::size_of::<LatencyValue>() == 16,
        "LatencyValue must be exactly 16 bytes"
    );
    assert!(
        core::mem::align_of::<LatencyValue>() == 8,
        "LatencyValue must be 8-byte aligned"
    );
    assert!(
        core::mem::size_of::<ConnKey>() == 16,
        "ConnKey must be exactly 16 bytes"
    );
};
