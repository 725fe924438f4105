//! Host-side model of the kernel datapath
//!
//! [`HostDatapath`] backs the same [`Datapath`] engine the BPF programs run,
//! with in-process tables instead of kernel maps. It is used by `replay` and
//! by the test suite to exercise the hook logic without a kernel.
//!
//! ```no_run
//! use upf_common::probe;
//! use upf_monitor::datapath::{HostDatapath, SkbImage};
//!
//! let dp = HostDatapath::new(2);
//! let skb = dp.place(&SkbImage::uplink(100, 42));
//! let _ = probe::encap_recv(&dp.core(0), skb);
//! let _ = probe::encap_recv_return(&dp.core(0), 0);
//! assert_eq!(dp.snapshot().tunnel(42).map(|c| c.packets), Some(1));
//! ```

pub mod memory;
pub mod percpu;
pub mod replay;
pub mod ring;
pub mod table;

pub use memory::{SimMemory, SkbImage};
pub use ring::{EventRing, Reservation};
pub use table::BoundedTable;

use crate::config::MonitorConfig;
use crate::control::ControlPlane;
use crate::metrics::snapshot::{sum_per_core, CounterSnapshot};
use crate::Result;
use percpu::{PendingSlots, PerCoreCounters};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use upf_common::probe::{Datapath, KernelRead, KeyedTable};
use upf_common::{
    ConfigFlag, Direction, DropEvent, PacketTraceEvent, PendingPacket, PendingSlot, SessionInfo,
    SkbLayout, TrafficCounter,
};

/// Clock step between two reads, in nanoseconds
const CLOCK_STEP_NS: u64 = 1_000;

pub struct HostDatapath {
    cores: usize,
    counters: PerCoreCounters,
    pending: PendingSlots,
    tunnels: BoundedTable<TrafficCounter>,
    subscribers: BoundedTable<TrafficCounter>,
    sessions: BoundedTable<SessionInfo>,
    toggles: [AtomicU32; ConfigFlag::SLOTS as usize],
    drops: EventRing<DropEvent>,
    traces: EventRing<PacketTraceEvent>,
    memory: SimMemory,
    layout: Option<SkbLayout>,
    clock: AtomicU64,
}

impl HostDatapath {
    /// Default capacities and ring sizes, every toggle off
    pub fn new(cores: usize) -> Self {
        Self::from_config(cores, &MonitorConfig::default())
    }

    /// Capacities, ring sizes, skb layout and initial toggles from `config`
    pub fn from_config(cores: usize, config: &MonitorConfig) -> Self {
        let cores = cores.max(1);
        let dp = Self {
            cores,
            counters: PerCoreCounters::new(cores),
            pending: PendingSlots::new(cores),
            tunnels: BoundedTable::new(config.tables.tunnels),
            subscribers: BoundedTable::new(config.tables.subscribers),
            sessions: BoundedTable::new(config.tables.sessions),
            toggles: Default::default(),
            drops: EventRing::with_byte_size(config.rings.drop_bytes),
            traces: EventRing::with_byte_size(config.rings.trace_bytes),
            memory: SimMemory::new(),
            layout: Some(config.skb_layout()),
            clock: AtomicU64::new(0),
        };
        for flag in ConfigFlag::ALL {
            dp.store_flag(flag, config.toggles.get(flag));
        }
        dp
    }

    /// Replace the event rings with rings of `drops` and `traces` records
    pub fn with_ring_capacity(mut self, drops: usize, traces: usize) -> Self {
        self.drops = EventRing::with_capacity(drops);
        self.traces = EventRing::with_capacity(traces);
        self
    }

    /// Model a loader that never wrote `SKB_LAYOUT`
    pub fn without_layout(mut self) -> Self {
        self.layout = None;
        self
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    /// View of the datapath from one core. Ids wrap around the core count.
    pub fn core(&self, id: usize) -> CoreView<'_> {
        CoreView {
            dp: self,
            id: id % self.cores,
        }
    }

    pub fn memory(&self) -> &SimMemory {
        &self.memory
    }

    /// Map a synthetic descriptor using the configured layout
    pub fn place(&self, image: &SkbImage) -> u64 {
        let layout = self.layout.unwrap_or_default();
        self.memory.place(image, &layout)
    }

    pub fn flag(&self, flag: ConfigFlag) -> bool {
        self.toggles[flag.index() as usize].load(Ordering::Relaxed) != 0
    }

    fn store_flag(&self, flag: ConfigFlag, enabled: bool) {
        self.toggles[flag.index() as usize].store(enabled as u32, Ordering::Relaxed);
    }

    pub fn session(&self, tunnel_id: u32) -> Option<SessionInfo> {
        self.sessions.get(tunnel_id)
    }

    pub fn tunnels(&self) -> &BoundedTable<TrafficCounter> {
        &self.tunnels
    }

    pub fn subscribers(&self) -> &BoundedTable<TrafficCounter> {
        &self.subscribers
    }

    pub fn drop_ring(&self) -> &EventRing<DropEvent> {
        &self.drops
    }

    pub fn trace_ring(&self) -> &EventRing<PacketTraceEvent> {
        &self.traces
    }

    pub fn drain_drops(&self, max: usize) -> Vec<DropEvent> {
        self.drops.drain(max)
    }

    pub fn drain_traces(&self, max: usize) -> Vec<PacketTraceEvent> {
        self.traces.drain(max)
    }

    /// Per-core slots of one direction, before summing
    pub fn per_core(&self, direction: Direction) -> Vec<TrafficCounter> {
        self.counters.per_core(direction)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let mut snapshot = CounterSnapshot {
            uplink: sum_per_core(self.counters.per_core(Direction::Uplink)),
            downlink: sum_per_core(self.counters.per_core(Direction::Downlink)),
            ..Default::default()
        };
        for (teid, counter) in self.tunnels.entries() {
            snapshot.insert_tunnel(teid, counter);
        }
        for (ue_ip, counter) in self.subscribers.entries() {
            snapshot.insert_subscriber(ue_ip, counter);
        }
        snapshot
    }

    fn table(&self, table: KeyedTable) -> &BoundedTable<TrafficCounter> {
        match table {
            KeyedTable::Tunnel => &self.tunnels,
            KeyedTable::Subscriber => &self.subscribers,
        }
    }

    fn now_ns(&self) -> u64 {
        self.clock.fetch_add(CLOCK_STEP_NS, Ordering::Relaxed) + CLOCK_STEP_NS
    }
}

impl ControlPlane for HostDatapath {
    fn set_flag(&mut self, flag: ConfigFlag, enabled: bool) -> Result<()> {
        self.store_flag(flag, enabled);
        Ok(())
    }

    fn upsert_session(&mut self, tunnel_id: u32, session: SessionInfo) -> Result<()> {
        if self.sessions.insert(tunnel_id, session) {
            Ok(())
        } else {
            Err(crate::MonitorError::MapError {
                map: upf_common::maps::TEID_SESSIONS.to_string(),
                reason: format!("table full ({} sessions)", self.sessions.capacity()),
            })
        }
    }

    fn remove_session(&mut self, tunnel_id: u32) -> Result<()> {
        self.sessions.remove(tunnel_id);
        Ok(())
    }
}

/// One core's view of a [`HostDatapath`]
#[derive(Clone, Copy)]
pub struct CoreView<'a> {
    dp: &'a HostDatapath,
    id: usize,
}

impl CoreView<'_> {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl KernelRead for CoreView<'_> {
    fn read_u16(&self, addr: u64) -> Option<u16> {
        self.dp.memory.read(addr).map(u16::from_ne_bytes)
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        self.dp.memory.read(addr).map(u32::from_ne_bytes)
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        self.dp.memory.read(addr).map(u64::from_ne_bytes)
    }

    fn read_bytes4(&self, addr: u64) -> Option<[u8; 4]> {
        self.dp.memory.read(addr)
    }
}

impl Datapath for CoreView<'_> {
    type DropSlot = Reservation<DropEvent>;
    type TraceSlot = Reservation<PacketTraceEvent>;

    fn now_ns(&self) -> u64 {
        self.dp.now_ns()
    }

    fn flag(&self, flag: ConfigFlag) -> bool {
        self.dp.flag(flag)
    }

    fn skb_layout(&self) -> Option<SkbLayout> {
        self.dp.layout
    }

    fn record_direction(&self, direction: Direction, len: u32, now_ns: u64) {
        self.dp.counters.record(self.id, direction, len, now_ns);
    }

    fn increment_keyed(&self, table: KeyedTable, key: u32, len: u32, now_ns: u64) -> bool {
        self.dp
            .table(table)
            .update(key, |counter| counter.record(len, now_ns))
    }

    fn insert_keyed(&self, table: KeyedTable, key: u32, counter: &TrafficCounter) -> bool {
        self.dp.table(table).insert(key, *counter)
    }

    fn session(&self, tunnel_id: u32) -> Option<SessionInfo> {
        self.dp.sessions.get(tunnel_id)
    }

    fn arm(&self, slot: PendingSlot, pending: PendingPacket) {
        self.dp.pending.arm(self.id, slot, pending);
    }

    fn take(&self, slot: PendingSlot) -> Option<PendingPacket> {
        self.dp.pending.take(self.id, slot)
    }

    fn reserve_drop(&self) -> Option<Self::DropSlot> {
        self.dp.drops.reserve()
    }

    fn reserve_trace(&self) -> Option<Self::TraceSlot> {
        self.dp.traces.reserve()
    }
}
