//! Point-in-time view of the counter store
//!
//! There is no snapshot isolation: tables are read while probes keep
//! updating them, so two counters in one snapshot may be a few packets apart.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use upf_common::TrafficCounter;

/// A counter as reported to users
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterTotals {
    pub packets: u64,
    pub bytes: u64,
    pub last_update_ns: u64,
}

impl From<TrafficCounter> for CounterTotals {
    fn from(counter: TrafficCounter) -> Self {
        Self {
            packets: counter.packets,
            bytes: counter.bytes,
            last_update_ns: counter.last_update_ns,
        }
    }
}

impl fmt::Display for CounterTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} packets, {} bytes", self.packets, self.bytes)
    }
}

/// Fold per-core slots into one total: packets and bytes add up, the update
/// time is the latest one.
pub fn sum_per_core<I>(slots: I) -> CounterTotals
where
    I: IntoIterator<Item = TrafficCounter>,
{
    slots
        .into_iter()
        .fold(CounterTotals::default(), |mut total, slot| {
            total.packets = total.packets.wrapping_add(slot.packets);
            total.bytes = total.bytes.wrapping_add(slot.bytes);
            total.last_update_ns = total.last_update_ns.max(slot.last_update_ns);
            total
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub uplink: CounterTotals,
    pub downlink: CounterTotals,
    /// Keyed by TEID
    pub tunnels: BTreeMap<u32, CounterTotals>,
    /// Keyed by UE IP
    pub subscribers: BTreeMap<Ipv4Addr, CounterTotals>,
}

impl CounterSnapshot {
    pub fn tunnel(&self, tunnel_id: u32) -> Option<CounterTotals> {
        self.tunnels.get(&tunnel_id).copied()
    }

    pub fn subscriber(&self, ue_ip: Ipv4Addr) -> Option<CounterTotals> {
        self.subscribers.get(&ue_ip).copied()
    }

    pub(crate) fn insert_tunnel(&mut self, tunnel_id: u32, counter: TrafficCounter) {
        self.tunnels.insert(tunnel_id, counter.into());
    }

    pub(crate) fn insert_subscriber(&mut self, ue_ip: u32, counter: TrafficCounter) {
        self.subscribers.insert(Ipv4Addr::from(ue_ip), counter.into());
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "uplink:   {}", self.uplink)?;
        writeln!(f, "downlink: {}", self.downlink)?;
        writeln!(f, "tunnels ({}):", self.tunnels.len())?;
        for (teid, counter) in &self.tunnels {
            writeln!(f, "  teid {:#010x}: {}", teid, counter)?;
        }
        writeln!(f, "subscribers ({}):", self.subscribers.len())?;
        for (ue_ip, counter) in &self.subscribers {
            writeln!(f, "  {}: {}", ue_ip, counter)?;
        }
        Ok(())
    }
}
