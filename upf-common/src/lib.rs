//! Shared types between eBPF (kernel) and userspace
//!
//! This crate defines the map values and event records that must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Shared between kernel probes and the userspace monitor
//!
//! It also carries the hot-path engine ([`probe`]) so the exact same hook
//! logic runs inside the BPF programs and inside the host-side model.
//!
//! IPv4 addresses are stored in host order (`u32::from_be_bytes` of the wire
//! bytes), so userspace converts them with `Ipv4Addr::from`.

#![cfg_attr(not(feature = "userspace"), no_std)]

pub mod config;
pub mod probe;
pub mod reason;
pub mod skb;

pub use config::ConfigFlag;
pub use reason::DropReason;
pub use skb::SkbLayout;

/// Map names shared by the probes and the loader
pub mod maps {
    pub const TRAFFIC_STATS: &str = "TRAFFIC_STATS";
    pub const TEID_STATS: &str = "TEID_STATS";
    pub const UE_IP_STATS: &str = "UE_IP_STATS";
    pub const TEID_SESSIONS: &str = "TEID_SESSIONS";
    pub const AGENT_CONFIG: &str = "AGENT_CONFIG";
    pub const SKB_LAYOUT: &str = "SKB_LAYOUT";
    pub const PENDING: &str = "PENDING";
    pub const DROP_EVENTS: &str = "DROP_EVENTS";
    pub const PACKET_EVENTS: &str = "PACKET_EVENTS";

    /// Default capacity of every keyed table (tunnels, subscribers, sessions)
    pub const KEYED_TABLE_CAPACITY: u32 = 4096;
    /// Drop event ring size in bytes
    pub const DROP_RING_BYTES: u32 = 256 * 1024;
    /// Trace event ring size in bytes, twice the drop ring
    pub const TRACE_RING_BYTES: u32 = 512 * 1024;
}

/// Traffic direction
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

impl Direction {
    pub const COUNT: usize = 2;

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Uplink),
            1 => Some(Direction::Downlink),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

/// Packet/byte counter kept per direction, per TEID and per UE IP.
///
/// Layout (24 bytes, 8-byte aligned).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct TrafficCounter {
    pub packets: u64,
    pub bytes: u64,
    pub last_update_ns: u64,
}

impl TrafficCounter {
    /// Counter for the first packet seen under a key
    #[inline(always)]
    pub const fn first(len: u32, now_ns: u64) -> Self {
        Self {
            packets: 1,
            bytes: len as u64,
            last_update_ns: now_ns,
        }
    }

    /// Plain read-modify-write. Only for slots a single core owns, or
    /// values behind a lock.
    #[inline(always)]
    pub fn record(&mut self, len: u32, now_ns: u64) {
        self.packets = self.packets.wrapping_add(1);
        self.bytes = self.bytes.wrapping_add(len as u64);
        self.last_update_ns = now_ns;
    }
}

/// Drop event sent to userspace through the drop ring.
///
/// Layout (32 bytes total, 8-byte aligned):
/// - timestamp_ns: Kernel monotonic timestamp, never zero
/// - tunnel_id: GTP-U TEID when known, else 0
/// - src_ip / dst_ip: IPv4 addresses when known, else 0
/// - src_port / dst_port: always 0 (no L4 parsing on the drop paths)
/// - packet_len: Packet length seen at entry, else 0
/// - reason: [`DropReason`] wire code
/// - direction: [`Direction`] wire value
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct DropEvent {
    pub timestamp_ns: u64,
    pub tunnel_id: u32,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub packet_len: u32,
    pub reason: u8,
    pub direction: u8,
    pub _padding: [u8; 2],
}

/// Detailed per-packet trace event, only produced while detailed tracing is on.
///
/// Layout (32 bytes total, explicit tail padding).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct PacketTraceEvent {
    pub timestamp_ns: u64,
    pub tunnel_id: u32,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub packet_len: u32,
    pub direction: u8,
    pub qfi: u8,
    pub _padding: [u8; 6],
}

/// PFCP session metadata keyed by TEID, written by the control-plane sniffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct SessionInfo {
    pub seid: u64,
    pub ue_ip: u32,
    pub upf_ip: u32,
    pub created_at_ns: u64,
}

/// Per-CPU scratch carried from an entry probe to its return probe.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct PendingPacket {
    pub tunnel_id: u32,
    pub ue_ip: u32,
    pub packet_len: u32,
    pub armed: u32,
}

/// Index into the per-CPU `PENDING` array, one slot per paired hook
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingSlot {
    EncapRecv = 0,
    DevXmit = 1,
    Forward = 2,
    Netfilter = 3,
}

impl PendingSlot {
    pub const COUNT: u32 = 4;
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<TrafficCounter>() == 24,
        "TrafficCounter must be exactly 24 bytes"
    );
    assert!(
        core::mem::size_of::<DropEvent>() == 32,
        "DropEvent must be exactly 32 bytes"
    );
    assert!(
        core::mem::align_of::<DropEvent>() == 8,
        "DropEvent must be 8-byte aligned"
    );
    assert!(
        core::mem::size_of::<PacketTraceEvent>() == 32,
        "PacketTraceEvent must be exactly 32 bytes"
    );
    assert!(
        core::mem::size_of::<SessionInfo>() == 24,
        "SessionInfo must be exactly 24 bytes"
    );
    assert!(
        core::mem::size_of::<PendingPacket>() == 16,
        "PendingPacket must be exactly 16 bytes"
    );
    assert!(
        core::mem::size_of::<SkbLayout>() == 16,
        "SkbLayout must be exactly 16 bytes"
    );
};

#[cfg(feature = "aya")]
mod pod {
    use super::{PendingPacket, SessionInfo, SkbLayout, TrafficCounter};

    // SAFETY: all of these are `#[repr(C)]`, `Copy`, contain only integers and
    // have no implicit padding.
    unsafe impl aya::Pod for TrafficCounter {}
    unsafe impl aya::Pod for SessionInfo {}
    unsafe impl aya::Pod for SkbLayout {}
    unsafe impl aya::Pod for PendingPacket {}
}
