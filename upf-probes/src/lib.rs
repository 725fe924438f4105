//! eBPF side of upf-monitor
//!
//! This crate owns the kernel maps and implements the shared
//! [`Datapath`](upf_common::probe::Datapath) engine over them:
//! - Per-CPU uplink/downlink aggregates (`TRAFFIC_STATS`)
//! - Per-TEID and per-UE-IP counters (`TEID_STATS`, `UE_IP_STATS`)
//! - Drop and packet trace rings (`DROP_EVENTS`, `PACKET_EVENTS`)
//! - Toggle registry, skb layout and session table written by userspace
//!
//! Probe entry points are in src/bin/

#![cfg_attr(not(test), no_std)]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    helpers::{bpf_ktime_get_ns, bpf_probe_read_kernel},
    macros::map,
    maps::{ring_buf::RingBufEntry, Array, HashMap, PerCpuArray, RingBuf},
};
use upf_common::{
    maps::{DROP_RING_BYTES, KEYED_TABLE_CAPACITY, TRACE_RING_BYTES},
    probe::{Datapath, EventSlot, KernelRead, KeyedTable},
    ConfigFlag, Direction, DropEvent, PacketTraceEvent, PendingPacket, PendingSlot, SessionInfo,
    SkbLayout, TrafficCounter,
};

/// Key 0 = uplink, 1 = downlink
#[map]
static TRAFFIC_STATS: PerCpuArray<TrafficCounter> =
    PerCpuArray::with_max_entries(Direction::COUNT as u32, 0);

#[map]
static TEID_STATS: HashMap<u32, TrafficCounter> =
    HashMap::with_max_entries(KEYED_TABLE_CAPACITY, 0);

#[map]
static UE_IP_STATS: HashMap<u32, TrafficCounter> =
    HashMap::with_max_entries(KEYED_TABLE_CAPACITY, 0);

/// Populated from userspace by the PFCP sniffer
#[map]
static TEID_SESSIONS: HashMap<u32, SessionInfo> =
    HashMap::with_max_entries(KEYED_TABLE_CAPACITY, 0);

#[map]
static AGENT_CONFIG: Array<u32> = Array::with_max_entries(ConfigFlag::SLOTS, 0);

#[map]
static SKB_LAYOUT: Array<SkbLayout> = Array::with_max_entries(1, 0);

#[map]
static PENDING: PerCpuArray<PendingPacket> = PerCpuArray::with_max_entries(PendingSlot::COUNT, 0);

#[map]
static DROP_EVENTS: RingBuf = RingBuf::with_byte_size(DROP_RING_BYTES, 0);

#[map]
static PACKET_EVENTS: RingBuf = RingBuf::with_byte_size(TRACE_RING_BYTES, 0);

/// The running kernel as seen from a probe
pub struct Kernel;

/// Reserved ring buffer record. The engine always publishes what it reserves,
/// which keeps the verifier's reserve/submit pairing satisfied.
pub struct RingSlot<T: 'static>(RingBufEntry<T>);

impl<T: 'static> EventSlot<T> for RingSlot<T> {
    #[inline(always)]
    fn publish(self, event: T) {
        let mut entry = self.0;
        entry.write(event);
        entry.submit(0);
    }
}

#[inline(always)]
fn keyed(table: KeyedTable) -> &'static HashMap<u32, TrafficCounter> {
    match table {
        KeyedTable::Tunnel => &TEID_STATS,
        KeyedTable::Subscriber => &UE_IP_STATS,
    }
}

/// Bump a counter in a map shared by every CPU. Packets and bytes use
/// `BPF_ATOMIC` adds. The timestamp is last writer wins.
#[inline(always)]
unsafe fn record_shared(counter: *mut TrafficCounter, len: u32, now_ns: u64) {
    AtomicU64::from_ptr(addr_of_mut!((*counter).packets)).fetch_add(1, Ordering::Relaxed);
    AtomicU64::from_ptr(addr_of_mut!((*counter).bytes)).fetch_add(len as u64, Ordering::Relaxed);
    AtomicU64::from_ptr(addr_of_mut!((*counter).last_update_ns)).store(now_ns, Ordering::Relaxed);
}

impl KernelRead for Kernel {
    #[inline(always)]
    fn read_u16(&self, addr: u64) -> Option<u16> {
        // SAFETY: bpf_probe_read_kernel validates the address and fails
        // instead of faulting.
        unsafe { bpf_probe_read_kernel(addr as *const u16).ok() }
    }

    #[inline(always)]
    fn read_u32(&self, addr: u64) -> Option<u32> {
        unsafe { bpf_probe_read_kernel(addr as *const u32).ok() }
    }

    #[inline(always)]
    fn read_u64(&self, addr: u64) -> Option<u64> {
        unsafe { bpf_probe_read_kernel(addr as *const u64).ok() }
    }

    #[inline(always)]
    fn read_bytes4(&self, addr: u64) -> Option<[u8; 4]> {
        unsafe { bpf_probe_read_kernel(addr as *const [u8; 4]).ok() }
    }
}

impl Datapath for Kernel {
    type DropSlot = RingSlot<DropEvent>;
    type TraceSlot = RingSlot<PacketTraceEvent>;

    #[inline(always)]
    fn now_ns(&self) -> u64 {
        // SAFETY: bpf_ktime_get_ns is always safe to call from eBPF context
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn flag(&self, flag: ConfigFlag) -> bool {
        match AGENT_CONFIG.get_ptr(flag.index()) {
            Some(value) => unsafe { *value != 0 },
            None => false,
        }
    }

    #[inline(always)]
    fn skb_layout(&self) -> Option<SkbLayout> {
        let layout = unsafe { *SKB_LAYOUT.get_ptr(0)? };
        // The array slot is zero-filled until the loader writes it
        if layout.len == 0 {
            None
        } else {
            Some(layout)
        }
    }

    #[inline(always)]
    fn record_direction(&self, direction: Direction, len: u32, now_ns: u64) {
        if let Some(counter) = TRAFFIC_STATS.get_ptr_mut(direction as u32) {
            // SAFETY: per-CPU slot, only this CPU writes it
            unsafe { (*counter).record(len, now_ns) };
        }
    }

    #[inline(always)]
    fn increment_keyed(&self, table: KeyedTable, key: u32, len: u32, now_ns: u64) -> bool {
        match keyed(table).get_ptr_mut(&key) {
            Some(counter) => {
                // SAFETY: the map value stays valid for the whole program run
                unsafe { record_shared(counter, len, now_ns) };
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn insert_keyed(&self, table: KeyedTable, key: u32, counter: &TrafficCounter) -> bool {
        // BPF_ANY: create or overwrite
        keyed(table).insert(&key, counter, 0).is_ok()
    }

    #[inline(always)]
    fn session(&self, tunnel_id: u32) -> Option<SessionInfo> {
        unsafe { TEID_SESSIONS.get(&tunnel_id).copied() }
    }

    #[inline(always)]
    fn arm(&self, slot: PendingSlot, pending: PendingPacket) {
        if let Some(ptr) = PENDING.get_ptr_mut(slot as u32) {
            unsafe { *ptr = pending };
        }
    }

    #[inline(always)]
    fn take(&self, slot: PendingSlot) -> Option<PendingPacket> {
        let ptr = PENDING.get_ptr_mut(slot as u32)?;
        let pending = unsafe { *ptr };
        if pending.armed == 0 {
            return None;
        }
        unsafe { *ptr = PendingPacket::default() };
        Some(pending)
    }

    #[inline(always)]
    fn reserve_drop(&self) -> Option<Self::DropSlot> {
        DROP_EVENTS.reserve::<DropEvent>(0).map(RingSlot)
    }

    #[inline(always)]
    fn reserve_trace(&self) -> Option<Self::TraceSlot> {
        PACKET_EVENTS.reserve::<PacketTraceEvent>(0).map(RingSlot)
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
