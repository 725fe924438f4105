//! eBPF probe loading, attachment and lifecycle

use super::events::{decode_or_skip, MonitorEvent, WireRecord};
use super::kallsyms::KernelSymbols;
use super::maps::{self, ConfigWriter, SessionWriter};
use super::preflight::run_preflight_checks;
use super::{HookKind, HookPoint, HookTarget, HOOK_POINTS};
use crate::config::MonitorConfig;
use crate::control::{apply_toggles, ControlPlane};
use crate::metrics::CounterSnapshot;
use crate::{MonitorError, Result};
use aya::maps::{MapData, RingBuf};
use aya::programs::{KProbe, TracePoint};
use aya::{Ebpf, EbpfLoader};
use tracing::{debug, info, warn};
use upf_common::maps::{DROP_EVENTS, PACKET_EVENTS, TEID_SESSIONS, TEID_STATS, UE_IP_STATS};
use upf_common::{ConfigFlag, DropEvent, PacketTraceEvent, SessionInfo};

/// Compiled probe object. Empty when the build had no bpf-linker.
const PROBES: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/upf_monitor"));

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttachStats {
    pub kprobes_attached: u32,
    pub kprobes_failed: u32,
    pub kretprobes_attached: u32,
    pub kretprobes_failed: u32,
    pub tracepoints_attached: u32,
    pub tracepoints_failed: u32,
}

impl AttachStats {
    fn record(&mut self, kind: HookKind, attached: bool) {
        let (ok, failed) = match kind {
            HookKind::Entry => (&mut self.kprobes_attached, &mut self.kprobes_failed),
            HookKind::Return => (&mut self.kretprobes_attached, &mut self.kretprobes_failed),
            HookKind::Standalone => (&mut self.tracepoints_attached, &mut self.tracepoints_failed),
        };
        if attached {
            *ok += 1;
        } else {
            *failed += 1;
        }
    }

    pub fn attached(&self) -> u32 {
        self.kprobes_attached + self.kretprobes_attached + self.tracepoints_attached
    }
}

/// Manages the probe object from load to unload
pub struct ProbeManager {
    bpf: Ebpf,
    stats: AttachStats,
}

impl ProbeManager {
    /// Load the probe object sized by `config`, publish the skb layout and
    /// the initial toggles. Nothing is attached yet.
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        run_preflight_checks()?;

        if PROBES.is_empty() {
            return Err(MonitorError::ProbesNotBuilt);
        }

        info!("Loading UPF probes...");
        let mut bpf = EbpfLoader::new()
            .set_max_entries(TEID_STATS, config.tables.tunnels)
            .set_max_entries(UE_IP_STATS, config.tables.subscribers)
            .set_max_entries(TEID_SESSIONS, config.tables.sessions)
            .set_max_entries(DROP_EVENTS, config.rings.drop_bytes)
            .set_max_entries(PACKET_EVENTS, config.rings.trace_bytes)
            .load(PROBES)
            .map_err(|e| MonitorError::EbpfError(format!("failed to load probe object: {}", e)))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            warn!(
                "Failed to initialize EbpfLogger: {}. eBPF probe logs will not be visible.",
                e
            );
        }

        // Probes read the layout on every hit, so it goes in before attach.
        maps::write_skb_layout(&mut bpf, config.skb_layout())?;

        let mut manager = Self {
            bpf,
            stats: AttachStats::default(),
        };
        apply_toggles(&mut manager, &config.toggles)?;
        Ok(manager)
    }

    /// Attach every hook. Required hooks abort on failure; optional ones are
    /// logged and skipped.
    pub fn attach(&mut self) -> Result<AttachStats> {
        let symbols = KernelSymbols::load().unwrap_or_else(|e| {
            warn!("Could not read kernel symbols: {}. Skipping symbol checks.", e);
            KernelSymbols::default()
        });

        for hook in HOOK_POINTS.iter() {
            let result =
                check_symbol(&symbols, hook).and_then(|()| attach_hook(&mut self.bpf, hook));
            self.stats.record(hook.kind, result.is_ok());

            match result {
                Ok(()) => debug!(
                    program = hook.program,
                    hook_target = %hook.target,
                    "attached {} hook",
                    hook.kind.as_str()
                ),
                Err(e) if hook.required => return Err(e),
                Err(e) => warn!(
                    program = hook.program,
                    hook_target = %hook.target,
                    error = %e,
                    "optional hook attach failed"
                ),
            }
        }

        log_attach_stats(&self.stats);
        Ok(self.stats)
    }

    pub fn stats(&self) -> AttachStats {
        self.stats
    }

    pub fn bpf_mut(&mut self) -> &mut Ebpf {
        &mut self.bpf
    }

    /// Aggregated counters across all cores and keyed tables
    pub fn counters(&self) -> Result<CounterSnapshot> {
        maps::read_counters(&self.bpf)
    }

    /// Take ownership of both event rings. Can only succeed once.
    pub fn take_rings(&mut self) -> Result<EventRings> {
        Ok(EventRings {
            drops: take_ring(&mut self.bpf, DROP_EVENTS)?,
            traces: take_ring(&mut self.bpf, PACKET_EVENTS)?,
        })
    }

    /// Detach and unload all probes
    pub fn unload(self) {
        info!("Unloading eBPF probes...");
        drop(self.bpf);
        info!("Probes unloaded");
    }
}

impl ControlPlane for ProbeManager {
    fn set_flag(&mut self, flag: ConfigFlag, enabled: bool) -> Result<()> {
        ConfigWriter::new(&mut self.bpf)?.set(flag, enabled)?;
        debug!(flag = flag.as_str(), enabled, "toggle written");
        Ok(())
    }

    fn upsert_session(&mut self, tunnel_id: u32, session: SessionInfo) -> Result<()> {
        SessionWriter::new(&mut self.bpf)?.upsert(tunnel_id, session)
    }

    fn remove_session(&mut self, tunnel_id: u32) -> Result<()> {
        SessionWriter::new(&mut self.bpf)?.remove(tunnel_id)
    }
}

/// Userspace ends of the drop and trace rings
pub struct EventRings {
    drops: RingBuf<MapData>,
    traces: RingBuf<MapData>,
}

impl EventRings {
    /// Drain up to `max_batch` records from each ring
    pub fn poll(&mut self, max_batch: usize) -> Vec<MonitorEvent> {
        let mut events = drain::<DropEvent>(&mut self.drops, max_batch);
        events.extend(drain::<PacketTraceEvent>(&mut self.traces, max_batch));
        events.sort_by_key(MonitorEvent::timestamp_ns);
        events
    }
}

fn drain<T: WireRecord>(ring: &mut RingBuf<MapData>, max_batch: usize) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    let mut seen = 0;

    while seen < max_batch {
        let Some(item) = ring.next() else {
            break;
        };
        seen += 1;
        events.extend(decode_or_skip::<T>(&item));
    }

    if seen == max_batch {
        debug!("Hit maximum batch size ({}) on {} ring", max_batch, T::KIND);
    }
    events
}

fn take_ring(bpf: &mut Ebpf, name: &str) -> Result<RingBuf<MapData>> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| MonitorError::MapNotFound(name.to_string()))?;
    RingBuf::try_from(map).map_err(|e| MonitorError::MapError {
        map: name.to_string(),
        reason: e.to_string(),
    })
}

fn check_symbol(symbols: &KernelSymbols, hook: &HookPoint) -> Result<()> {
    match hook.symbol() {
        Some(symbol) if !symbols.is_empty() && !symbols.contains(symbol) => {
            Err(MonitorError::SymbolNotFound(symbol.to_string()))
        }
        _ => Ok(()),
    }
}

fn attach_hook(bpf: &mut Ebpf, hook: &HookPoint) -> Result<()> {
    let program = bpf
        .program_mut(hook.program)
        .ok_or_else(|| MonitorError::ProgramLoadFailed {
            program: hook.program.to_string(),
            reason: "not found in probe object".to_string(),
        })?;

    let load_failed = |reason: String| MonitorError::ProgramLoadFailed {
        program: hook.program.to_string(),
        reason,
    };
    let attach_failed = |reason: String| MonitorError::AttachFailed {
        program: hook.program.to_string(),
        target: hook.target.to_string(),
        reason,
    };

    match hook.target {
        HookTarget::Kprobe(symbol) => {
            let program: &mut KProbe =
                program.try_into().map_err(|e| load_failed(format!("{}", e)))?;
            program.load().map_err(|e| load_failed(e.to_string()))?;
            program
                .attach(symbol, 0)
                .map_err(|e| attach_failed(e.to_string()))?;
        }
        HookTarget::Tracepoint { category, name } => {
            let program: &mut TracePoint =
                program.try_into().map_err(|e| load_failed(format!("{}", e)))?;
            program.load().map_err(|e| load_failed(e.to_string()))?;
            program
                .attach(category, name)
                .map_err(|e| attach_failed(e.to_string()))?;
        }
    }
    Ok(())
}

fn log_attach_stats(stats: &AttachStats) {
    info!(
        kprobes_attached = stats.kprobes_attached,
        kprobes_failed = stats.kprobes_failed,
        kretprobes_attached = stats.kretprobes_attached,
        kretprobes_failed = stats.kretprobes_failed,
        tracepoints_attached = stats.tracepoints_attached,
        tracepoints_failed = stats.tracepoints_failed,
        "Probe attachment summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_stats_by_kind() {
        let mut stats = AttachStats::default();
        stats.record(HookKind::Entry, true);
        stats.record(HookKind::Return, true);
        stats.record(HookKind::Standalone, false);
        stats.record(HookKind::Entry, false);

        assert_eq!(stats.kprobes_attached, 1);
        assert_eq!(stats.kprobes_failed, 1);
        assert_eq!(stats.kretprobes_attached, 1);
        assert_eq!(stats.tracepoints_failed, 1);
        assert_eq!(stats.attached(), 2);
    }

    #[test]
    fn test_missing_symbol_is_reported() {
        let symbols = KernelSymbols::parse("ffffffff81a2b3c0 T ip_forward\n");
        let encap = &HOOK_POINTS[0];
        let forward = HOOK_POINTS
            .iter()
            .find(|h| h.symbol() == Some("ip_forward"))
            .unwrap();
        let tracepoint = HOOK_POINTS
            .iter()
            .find(|h| h.kind == HookKind::Standalone)
            .unwrap();

        assert!(matches!(
            check_symbol(&symbols, encap),
            Err(MonitorError::SymbolNotFound(s)) if s == "gtp5g_encap_recv"
        ));
        assert!(check_symbol(&symbols, forward).is_ok());
        assert!(check_symbol(&symbols, tracepoint).is_ok());
    }

    #[test]
    fn test_unreadable_symbol_table_skips_check() {
        let symbols = KernelSymbols::default();
        assert!(HOOK_POINTS.iter().all(|h| check_symbol(&symbols, h).is_ok()));
    }
}
