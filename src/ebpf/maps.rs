//! Typed access to the probe maps from userspace

use crate::metrics::snapshot::{sum_per_core, CounterSnapshot};
use crate::{MonitorError, Result};
use aya::maps::{Array, HashMap, MapData, PerCpuArray};
use aya::Ebpf;
use upf_common::maps::{AGENT_CONFIG, SKB_LAYOUT, TEID_SESSIONS, TEID_STATS, TRAFFIC_STATS, UE_IP_STATS};
use upf_common::{ConfigFlag, Direction, SessionInfo, SkbLayout, TrafficCounter};

fn map_error(map: &str, error: impl std::fmt::Display) -> MonitorError {
    MonitorError::MapError {
        map: map.to_string(),
        reason: error.to_string(),
    }
}

fn map_mut<'a>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut aya::maps::Map> {
    bpf.map_mut(name)
        .ok_or_else(|| MonitorError::MapNotFound(name.to_string()))
}

fn map<'a>(bpf: &'a Ebpf, name: &str) -> Result<&'a aya::maps::Map> {
    bpf.map(name)
        .ok_or_else(|| MonitorError::MapNotFound(name.to_string()))
}

/// Writer for the `AGENT_CONFIG` toggle registry
pub struct ConfigWriter<'a> {
    array: Array<&'a mut MapData, u32>,
}

impl<'a> ConfigWriter<'a> {
    pub fn new(bpf: &'a mut Ebpf) -> Result<Self> {
        let array = Array::try_from(map_mut(bpf, AGENT_CONFIG)?)
            .map_err(|e| map_error(AGENT_CONFIG, e))?;
        Ok(Self { array })
    }

    pub fn set(&mut self, flag: ConfigFlag, enabled: bool) -> Result<()> {
        self.array
            .set(flag.index(), enabled as u32, 0)
            .map_err(|e| map_error(AGENT_CONFIG, e))
    }
}

/// Writer for the `TEID_SESSIONS` table, used by the control-plane sniffer
pub struct SessionWriter<'a> {
    table: HashMap<&'a mut MapData, u32, SessionInfo>,
}

impl<'a> SessionWriter<'a> {
    pub fn new(bpf: &'a mut Ebpf) -> Result<Self> {
        let table = HashMap::try_from(map_mut(bpf, TEID_SESSIONS)?)
            .map_err(|e| map_error(TEID_SESSIONS, e))?;
        Ok(Self { table })
    }

    pub fn upsert(&mut self, tunnel_id: u32, session: SessionInfo) -> Result<()> {
        self.table
            .insert(tunnel_id, session, 0)
            .map_err(|e| map_error(TEID_SESSIONS, e))
    }

    /// Removing an unknown TEID is not an error
    pub fn remove(&mut self, tunnel_id: u32) -> Result<()> {
        match self.table.get(&tunnel_id, 0) {
            Ok(_) => {}
            Err(aya::maps::MapError::KeyNotFound) => return Ok(()),
            Err(e) => return Err(map_error(TEID_SESSIONS, e)),
        }
        self.table
            .remove(&tunnel_id)
            .map_err(|e| map_error(TEID_SESSIONS, e))
    }
}

/// Publish the skb field offsets. Must happen before any probe attaches.
pub fn write_skb_layout(bpf: &mut Ebpf, layout: SkbLayout) -> Result<()> {
    let mut array: Array<&mut MapData, SkbLayout> =
        Array::try_from(map_mut(bpf, SKB_LAYOUT)?).map_err(|e| map_error(SKB_LAYOUT, e))?;
    array
        .set(0, layout, 0)
        .map_err(|e| map_error(SKB_LAYOUT, e))
}

/// Read every counter the probes maintain
pub fn read_counters(bpf: &Ebpf) -> Result<CounterSnapshot> {
    let per_cpu: PerCpuArray<&MapData, TrafficCounter> =
        PerCpuArray::try_from(map(bpf, TRAFFIC_STATS)?).map_err(|e| map_error(TRAFFIC_STATS, e))?;

    let mut snapshot = CounterSnapshot::default();
    for direction in [Direction::Uplink, Direction::Downlink] {
        let values = per_cpu
            .get(&(direction as u32), 0)
            .map_err(|e| map_error(TRAFFIC_STATS, e))?;
        let total = sum_per_core(values.iter().copied());
        match direction {
            Direction::Uplink => snapshot.uplink = total,
            Direction::Downlink => snapshot.downlink = total,
        }
    }

    for (key, value) in read_table(bpf, TEID_STATS)? {
        snapshot.insert_tunnel(key, value);
    }
    for (key, value) in read_table(bpf, UE_IP_STATS)? {
        snapshot.insert_subscriber(key, value);
    }
    Ok(snapshot)
}

fn read_table(bpf: &Ebpf, name: &str) -> Result<Vec<(u32, TrafficCounter)>> {
    let table: HashMap<&MapData, u32, TrafficCounter> =
        HashMap::try_from(map(bpf, name)?).map_err(|e| map_error(name, e))?;
    // Entries may vanish or appear while iterating, so a failed lookup just
    // skips that key.
    Ok(table.iter().filter_map(|entry| entry.ok()).collect())
}
