//! Hot-path engine shared by the BPF programs and the host model
//!
//! Every hook is written once against [`Datapath`]. The BPF side implements
//! it over kernel maps and `bpf_probe_read_kernel`, the host side over
//! in-memory tables, so the accounting and classification rules cannot drift
//! apart.
//!
//! Hooks never fail upward. They return a [`Skip`] describing why the rest of
//! the observation was abandoned, and callers discard it.

use crate::reason::{classify_downlink, classify_forward, classify_netfilter, classify_uplink};
use crate::skb::{
    SkbLayout, GTP_TEID_OFFSET, IPV4_DST_OFFSET, IPV4_MIN_HEADER_LEN, MIN_PLAUSIBLE_PACKET_LEN,
    UDP_HEADER_LEN,
};
use crate::{
    ConfigFlag, Direction, DropEvent, DropReason, PacketTraceEvent, PendingPacket, PendingSlot,
    SessionInfo, TrafficCounter,
};

/// Why a hook stopped early
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Skip {
    /// The gating toggle is off
    Disabled,
    /// A pointer, offset or field could not be read
    Unreadable,
    /// A lookup key (TEID, UE IP) was absent or zero
    NotFound,
    /// The buffer is too short to be a real packet
    Filtered,
    /// A table or ring had no room
    Full,
}

pub type ProbeResult = Result<(), Skip>;

/// Fallible reads from kernel memory. Every read may fail.
pub trait KernelRead {
    fn read_u16(&self, addr: u64) -> Option<u16>;
    fn read_u32(&self, addr: u64) -> Option<u32>;
    fn read_u64(&self, addr: u64) -> Option<u64>;
    /// Raw bytes, in memory order
    fn read_bytes4(&self, addr: u64) -> Option<[u8; 4]>;
}

/// Shared keyed counter tables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyedTable {
    /// Uplink, keyed by TEID
    Tunnel,
    /// Downlink, keyed by UE IP
    Subscriber,
}

/// A reserved slot in an event ring. Publishing consumes it. Dropping it
/// without publishing gives the space back.
pub trait EventSlot<T> {
    fn publish(self, event: T);
}

/// Everything a hook may touch
pub trait Datapath: KernelRead {
    type DropSlot: EventSlot<DropEvent>;
    type TraceSlot: EventSlot<PacketTraceEvent>;

    fn now_ns(&self) -> u64;
    /// Toggle registry read. A missing slot reads as disabled.
    fn flag(&self, flag: ConfigFlag) -> bool;
    fn skb_layout(&self) -> Option<SkbLayout>;

    /// Bump this core's aggregate slot for `direction`
    fn record_direction(&self, direction: Direction, len: u32, now_ns: u64);
    /// Increment an existing key in place, safe against concurrent updates
    /// of the same key from other cores. Returns false if the key is absent.
    fn increment_keyed(&self, table: KeyedTable, key: u32, len: u32, now_ns: u64) -> bool;
    /// Create-or-overwrite. Returns false if the table is full.
    fn insert_keyed(&self, table: KeyedTable, key: u32, counter: &TrafficCounter) -> bool;

    fn session(&self, tunnel_id: u32) -> Option<SessionInfo>;

    fn arm(&self, slot: PendingSlot, pending: PendingPacket);
    /// Read and clear a pending slot
    fn take(&self, slot: PendingSlot) -> Option<PendingPacket>;

    fn reserve_drop(&self) -> Option<Self::DropSlot>;
    fn reserve_trace(&self) -> Option<Self::TraceSlot>;
}

/// `kprobe/gtp5g_encap_recv`: uplink GTP-U packet entering the UPF.
#[inline(always)]
pub fn encap_recv<D: Datapath>(dp: &D, skb: u64) -> ProbeResult {
    let layout = dp.skb_layout().ok_or(Skip::Unreadable)?;
    let len = skb_len(dp, &layout, skb)?;
    let head = dp
        .read_u64(skb + layout.head as u64)
        .filter(|head| *head != 0)
        .ok_or(Skip::Unreadable)?;

    let now = dp.now_ns();
    dp.record_direction(Direction::Uplink, len, now);

    let teid = tunnel_id(dp, &layout, skb, head);
    let session = teid.and_then(|teid| dp.session(teid));
    dp.arm(
        PendingSlot::EncapRecv,
        PendingPacket {
            tunnel_id: teid.unwrap_or(0),
            ue_ip: session.map(|s| s.ue_ip).unwrap_or(0),
            packet_len: len,
            armed: 1,
        },
    );

    let teid = teid.ok_or(Skip::NotFound)?;
    // A full table only loses the new counter, the trace still goes out
    let keyed = record_keyed(dp, KeyedTable::Tunnel, teid, len, now);

    let (src_ip, dst_ip) = session.map(|s| (s.ue_ip, s.upf_ip)).unwrap_or((0, 0));
    let traced = emit_trace(dp, teid, src_ip, dst_ip, len, Direction::Uplink);
    keyed.and(traced)
}

/// `kretprobe/gtp5g_encap_recv`: a negative return is an uplink drop.
#[inline(always)]
pub fn encap_recv_return<D: Datapath>(dp: &D, ret: i32) -> ProbeResult {
    let pending = dp.take(PendingSlot::EncapRecv).unwrap_or_default();
    let Some(reason) = classify_uplink(ret) else {
        return Ok(());
    };

    let (src_ip, dst_ip) = if pending.tunnel_id != 0 {
        dp.session(pending.tunnel_id)
            .map(|s| (s.ue_ip, s.upf_ip))
            .unwrap_or((pending.ue_ip, 0))
    } else {
        (0, 0)
    };

    emit_drop(
        dp,
        drop_event(
            pending.tunnel_id,
            src_ip,
            dst_ip,
            pending.packet_len,
            reason,
            Direction::Uplink,
        ),
    )
}

/// `kprobe/gtp5g_dev_xmit`: downlink packet handed to the GTP device.
///
/// The TEID is only assigned during encapsulation, so downlink accounting is
/// keyed by the inner destination address (the UE IP).
#[inline(always)]
pub fn dev_xmit<D: Datapath>(dp: &D, skb: u64) -> ProbeResult {
    let layout = dp.skb_layout().ok_or(Skip::Unreadable)?;
    let len = skb_len(dp, &layout, skb)?;

    let now = dp.now_ns();
    dp.record_direction(Direction::Downlink, len, now);

    let ue_ip = inner_destination(dp, &layout, skb, len);
    dp.arm(
        PendingSlot::DevXmit,
        PendingPacket {
            tunnel_id: 0,
            ue_ip: ue_ip.unwrap_or(0),
            packet_len: len,
            armed: 1,
        },
    );

    let ue_ip = ue_ip.ok_or(Skip::NotFound)?;
    let keyed = record_keyed(dp, KeyedTable::Subscriber, ue_ip, len, now);
    let traced = emit_trace(dp, 0, 0, ue_ip, len, Direction::Downlink);
    keyed.and(traced)
}

/// `kretprobe/gtp5g_dev_xmit`: anything but `NETDEV_TX_OK` is a drop.
#[inline(always)]
pub fn dev_xmit_return<D: Datapath>(dp: &D, ret: i32) -> ProbeResult {
    let pending = dp.take(PendingSlot::DevXmit).unwrap_or_default();
    let Some(reason) = classify_downlink(ret) else {
        return Ok(());
    };

    emit_drop(
        dp,
        drop_event(
            0,
            0,
            pending.ue_ip,
            pending.packet_len,
            reason,
            Direction::Downlink,
        ),
    )
}

/// `tracepoint/skb/kfree_skb`: any buffer released by the kernel.
///
/// This path fires far more often than the UPF hooks. The toggle check comes
/// before anything else, including reading the tracepoint record, which is
/// why the buffer address is passed lazily.
#[inline(always)]
pub fn free_skb<D, F>(dp: &D, skbaddr: F) -> ProbeResult
where
    D: Datapath,
    F: FnOnce() -> Option<u64>,
{
    if !dp.flag(ConfigFlag::DropTracing) {
        return Err(Skip::Disabled);
    }

    let skb = skbaddr().ok_or(Skip::Unreadable)?;
    let layout = dp.skb_layout().ok_or(Skip::Unreadable)?;
    let len = skb_len(dp, &layout, skb)?;
    if len < MIN_PLAUSIBLE_PACKET_LEN {
        return Err(Skip::Filtered);
    }

    emit_drop(
        dp,
        drop_event(0, 0, 0, len, DropReason::Kernel, Direction::Uplink),
    )
}

/// `kprobe/ip_forward`: remember the length for the return probe.
#[inline(always)]
pub fn forward<D, F>(dp: &D, skb: F) -> ProbeResult
where
    D: Datapath,
    F: FnOnce() -> Option<u64>,
{
    gated_entry(dp, PendingSlot::Forward, skb)
}

/// `kretprobe/ip_forward`: a non-zero return is a routing drop.
#[inline(always)]
pub fn forward_return<D: Datapath>(dp: &D, ret: i32) -> ProbeResult {
    gated_return(dp, PendingSlot::Forward, classify_forward(ret))
}

/// `kprobe/nf_hook_slow`: remember the length for the verdict probe.
#[inline(always)]
pub fn netfilter<D, F>(dp: &D, skb: F) -> ProbeResult
where
    D: Datapath,
    F: FnOnce() -> Option<u64>,
{
    gated_entry(dp, PendingSlot::Netfilter, skb)
}

/// `kretprobe/nf_hook_slow`: a negative verdict is a firewall drop.
#[inline(always)]
pub fn netfilter_return<D: Datapath>(dp: &D, ret: i32) -> ProbeResult {
    gated_return(dp, PendingSlot::Netfilter, classify_netfilter(ret))
}

#[inline(always)]
fn gated_entry<D, F>(dp: &D, slot: PendingSlot, skb: F) -> ProbeResult
where
    D: Datapath,
    F: FnOnce() -> Option<u64>,
{
    if !dp.flag(ConfigFlag::NetfilterTracing) {
        return Err(Skip::Disabled);
    }

    let skb = skb().ok_or(Skip::Unreadable)?;
    let layout = dp.skb_layout().ok_or(Skip::Unreadable)?;
    let len = skb_len(dp, &layout, skb)?;
    dp.arm(
        slot,
        PendingPacket {
            tunnel_id: 0,
            ue_ip: 0,
            packet_len: len,
            armed: 1,
        },
    );
    Ok(())
}

#[inline(always)]
fn gated_return<D: Datapath>(dp: &D, slot: PendingSlot, reason: Option<DropReason>) -> ProbeResult {
    // Always cleared, whatever the toggle says now
    let pending = dp.take(slot).unwrap_or_default();
    if !dp.flag(ConfigFlag::NetfilterTracing) {
        return Err(Skip::Disabled);
    }

    let Some(reason) = reason else {
        return Ok(());
    };
    emit_drop(
        dp,
        drop_event(0, 0, 0, pending.packet_len, reason, Direction::Uplink),
    )
}

#[inline(always)]
fn skb_len<D: Datapath>(dp: &D, layout: &SkbLayout, skb: u64) -> Result<u32, Skip> {
    if skb == 0 {
        return Err(Skip::Unreadable);
    }
    dp.read_u32(skb + layout.len as u64).ok_or(Skip::Unreadable)
}

/// TEID of the GTP-U header following the outer UDP header.
/// A zero transport offset or a zero TEID means "not found".
#[inline(always)]
fn tunnel_id<D: Datapath>(dp: &D, layout: &SkbLayout, skb: u64, head: u64) -> Option<u32> {
    let transport = dp.read_u16(skb + layout.transport_header as u64)?;
    if transport == 0 {
        return None;
    }
    let gtp = head + transport as u64 + UDP_HEADER_LEN;
    let teid = u32::from_be_bytes(dp.read_bytes4(gtp + GTP_TEID_OFFSET)?);
    if teid == 0 {
        None
    } else {
        Some(teid)
    }
}

/// Destination address of the inner IPv4 header at `skb->data`.
#[inline(always)]
fn inner_destination<D: Datapath>(dp: &D, layout: &SkbLayout, skb: u64, len: u32) -> Option<u32> {
    if len < IPV4_MIN_HEADER_LEN {
        return None;
    }
    let data = dp.read_u64(skb + layout.data as u64)?;
    if data == 0 {
        return None;
    }
    let dst = u32::from_be_bytes(dp.read_bytes4(data + IPV4_DST_OFFSET)?);
    if dst == 0 {
        None
    } else {
        Some(dst)
    }
}

/// Lookup-then-insert update of a shared counter table.
///
/// Known limitation: the lookup and the insert are two separate map
/// operations. When two cores see the first packet of a new key at the same
/// time, both insert a fresh counter and one of the two increments is lost.
/// Once the key exists, [`Datapath::increment_keyed`] must be atomic with
/// respect to other cores.
#[inline(always)]
fn record_keyed<D: Datapath>(
    dp: &D,
    table: KeyedTable,
    key: u32,
    len: u32,
    now_ns: u64,
) -> ProbeResult {
    if dp.increment_keyed(table, key, len, now_ns) {
        return Ok(());
    }
    if dp.insert_keyed(table, key, &TrafficCounter::first(len, now_ns)) {
        Ok(())
    } else {
        Err(Skip::Full)
    }
}

#[inline(always)]
fn drop_event(
    tunnel_id: u32,
    src_ip: u32,
    dst_ip: u32,
    packet_len: u32,
    reason: DropReason,
    direction: Direction,
) -> DropEvent {
    DropEvent {
        timestamp_ns: 0,
        tunnel_id,
        src_ip,
        dst_ip,
        src_port: 0,
        dst_port: 0,
        packet_len,
        reason: reason as u8,
        direction: direction as u8,
        _padding: [0; 2],
    }
}

/// Reserve, stamp, publish. A full ring abandons the event.
#[inline(always)]
fn emit_drop<D: Datapath>(dp: &D, mut event: DropEvent) -> ProbeResult {
    let slot = dp.reserve_drop().ok_or(Skip::Full)?;
    event.timestamp_ns = timestamp(dp);
    slot.publish(event);
    Ok(())
}

#[inline(always)]
fn emit_trace<D: Datapath>(
    dp: &D,
    tunnel_id: u32,
    src_ip: u32,
    dst_ip: u32,
    packet_len: u32,
    direction: Direction,
) -> ProbeResult {
    // Tracing off is not a failure of the observation
    if !dp.flag(ConfigFlag::DetailedTracing) {
        return Ok(());
    }
    let slot = dp.reserve_trace().ok_or(Skip::Full)?;
    slot.publish(PacketTraceEvent {
        timestamp_ns: timestamp(dp),
        tunnel_id,
        src_ip,
        dst_ip,
        packet_len,
        direction: direction as u8,
        // QFI lives in the PDU session container extension header, which
        // is not parsed.
        qfi: 0,
        _padding: [0; 6],
    });
    Ok(())
}

#[inline(always)]
fn timestamp<D: Datapath>(dp: &D) -> u64 {
    let now = dp.now_ns();
    if now == 0 {
        1
    } else {
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Datapath that can read nothing and records calls
    #[derive(Default)]
    struct Blind {
        drop_tracing: bool,
        netfilter: bool,
        drops: Rc<RefCell<Vec<DropEvent>>>,
        pending: Cell<Option<PendingPacket>>,
        direction_updates: Cell<u32>,
    }

    struct Slot(Rc<RefCell<Vec<DropEvent>>>);

    impl EventSlot<DropEvent> for Slot {
        fn publish(self, event: DropEvent) {
            self.0.borrow_mut().push(event);
        }
    }

    struct NoTrace;

    impl EventSlot<PacketTraceEvent> for NoTrace {
        fn publish(self, _event: PacketTraceEvent) {}
    }

    impl KernelRead for Blind {
        fn read_u16(&self, _addr: u64) -> Option<u16> {
            None
        }
        fn read_u32(&self, _addr: u64) -> Option<u32> {
            None
        }
        fn read_u64(&self, _addr: u64) -> Option<u64> {
            None
        }
        fn read_bytes4(&self, _addr: u64) -> Option<[u8; 4]> {
            None
        }
    }

    impl Datapath for Blind {
        type DropSlot = Slot;
        type TraceSlot = NoTrace;

        fn now_ns(&self) -> u64 {
            0
        }
        fn flag(&self, flag: ConfigFlag) -> bool {
            match flag {
                ConfigFlag::DropTracing => self.drop_tracing,
                ConfigFlag::NetfilterTracing => self.netfilter,
                _ => false,
            }
        }
        fn skb_layout(&self) -> Option<SkbLayout> {
            Some(SkbLayout::DEFAULT)
        }
        fn record_direction(&self, _direction: Direction, _len: u32, _now_ns: u64) {
            self.direction_updates.set(self.direction_updates.get() + 1);
        }
        fn increment_keyed(&self, _t: KeyedTable, _k: u32, _l: u32, _n: u64) -> bool {
            false
        }
        fn insert_keyed(&self, _t: KeyedTable, _k: u32, _c: &TrafficCounter) -> bool {
            false
        }
        fn session(&self, _tunnel_id: u32) -> Option<SessionInfo> {
            None
        }
        fn arm(&self, _slot: PendingSlot, pending: PendingPacket) {
            self.pending.set(Some(pending));
        }
        fn take(&self, _slot: PendingSlot) -> Option<PendingPacket> {
            self.pending.take()
        }
        fn reserve_drop(&self) -> Option<Self::DropSlot> {
            Some(Slot(Rc::clone(&self.drops)))
        }
        fn reserve_trace(&self) -> Option<Self::TraceSlot> {
            Some(NoTrace)
        }
    }

    #[test]
    fn test_free_path_disabled_does_not_touch_record() {
        let dp = Blind::default();
        let touched = Cell::new(false);

        let result = free_skb(&dp, || {
            touched.set(true);
            Some(0x1000)
        });

        assert_eq!(result, Err(Skip::Disabled));
        assert!(!touched.get());
        assert!(dp.drops.borrow().is_empty());
    }

    #[test]
    fn test_unreadable_descriptor_has_no_side_effects() {
        let dp = Blind::default();

        assert_eq!(encap_recv(&dp, 0xffff_8880_0000_1000), Err(Skip::Unreadable));
        assert_eq!(dev_xmit(&dp, 0), Err(Skip::Unreadable));
        assert_eq!(dp.direction_updates.get(), 0);
        assert!(dp.pending.get().is_none());
    }

    #[test]
    fn test_return_without_entry_still_emits_once() {
        let dp = Blind::default();

        assert_eq!(encap_recv_return(&dp, -22), Ok(()));

        let drops = dp.drops.borrow();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].reason, DropReason::InvalidTeid as u8);
        assert_eq!(drops[0].packet_len, 0);
        assert_eq!(drops[0].timestamp_ns, 1);
    }

    #[test]
    fn test_netfilter_gate_checked_first() {
        let dp = Blind::default();
        let touched = Cell::new(false);

        let result = netfilter(&dp, || {
            touched.set(true);
            None
        });

        assert_eq!(result, Err(Skip::Disabled));
        assert!(!touched.get());
        assert_eq!(netfilter_return(&dp, -1), Err(Skip::Disabled));
        assert!(dp.drops.borrow().is_empty());
    }

    #[test]
    fn test_disabled_return_still_clears_pending() {
        let dp = Blind::default();
        dp.arm(
            PendingSlot::Netfilter,
            PendingPacket {
                packet_len: 300,
                armed: 1,
                ..Default::default()
            },
        );

        assert_eq!(netfilter_return(&dp, -1), Err(Skip::Disabled));
        assert!(dp.pending.get().is_none());
    }

    #[test]
    fn test_free_path_enabled_but_unreadable() {
        let dp = Blind {
            drop_tracing: true,
            ..Default::default()
        };

        assert_eq!(free_skb(&dp, || Some(0x1000)), Err(Skip::Unreadable));
        assert_eq!(free_skb(&dp, || None), Err(Skip::Unreadable));
        assert!(dp.drops.borrow().is_empty());
    }
}
