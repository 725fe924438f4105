//! Per-core storage. Each slot is written only by the view of its own core,
//! so plain relaxed atomics are enough; readers sum across cores.

use std::sync::atomic::{AtomicU64, Ordering};
use upf_common::{Direction, PendingPacket, PendingSlot, TrafficCounter};

#[derive(Default)]
struct CounterSlot {
    packets: AtomicU64,
    bytes: AtomicU64,
    last_update_ns: AtomicU64,
}

impl CounterSlot {
    fn record(&self, len: u32, now_ns: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.last_update_ns.store(now_ns, Ordering::Relaxed);
    }

    fn load(&self) -> TrafficCounter {
        TrafficCounter {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            last_update_ns: self.last_update_ns.load(Ordering::Relaxed),
        }
    }
}

/// The 2-slot direction array, once per core
pub struct PerCoreCounters {
    cores: Vec<[CounterSlot; Direction::COUNT]>,
}

impl PerCoreCounters {
    pub fn new(cores: usize) -> Self {
        Self {
            cores: (0..cores).map(|_| Default::default()).collect(),
        }
    }

    pub fn record(&self, core: usize, direction: Direction, len: u32, now_ns: u64) {
        self.cores[core][direction as usize].record(len, now_ns);
    }

    /// One value per core, like a per-CPU map lookup from userspace
    pub fn per_core(&self, direction: Direction) -> Vec<TrafficCounter> {
        self.cores
            .iter()
            .map(|slots| slots[direction as usize].load())
            .collect()
    }
}

/// One pending packet packed into two words:
/// `tunnel_id << 32 | ue_ip` and `packet_len << 32 | armed`.
#[derive(Default)]
struct PendingCell {
    ids: AtomicU64,
    state: AtomicU64,
}

pub struct PendingSlots {
    cores: Vec<[PendingCell; PendingSlot::COUNT as usize]>,
}

impl PendingSlots {
    pub fn new(cores: usize) -> Self {
        Self {
            cores: (0..cores).map(|_| Default::default()).collect(),
        }
    }

    pub fn arm(&self, core: usize, slot: PendingSlot, pending: PendingPacket) {
        let cell = &self.cores[core][slot as usize];
        cell.ids.store(
            (pending.tunnel_id as u64) << 32 | pending.ue_ip as u64,
            Ordering::Relaxed,
        );
        cell.state.store(
            (pending.packet_len as u64) << 32 | pending.armed as u64,
            Ordering::Relaxed,
        );
    }

    pub fn take(&self, core: usize, slot: PendingSlot) -> Option<PendingPacket> {
        let cell = &self.cores[core][slot as usize];
        let state = cell.state.swap(0, Ordering::Relaxed);
        let ids = cell.ids.swap(0, Ordering::Relaxed);
        let armed = state as u32;
        if armed == 0 {
            return None;
        }
        Some(PendingPacket {
            tunnel_id: (ids >> 32) as u32,
            ue_ip: ids as u32,
            packet_len: (state >> 32) as u32,
            armed,
        })
    }
}
