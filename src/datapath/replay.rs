//! Offline replay of packet observations through the hook engine
//!
//! A scenario is a YAML document:
//!
//! ```yaml
//! cores: 2
//! toggles:
//!   detailed_tracing: true
//! sessions:
//!   - teid: 42
//!     seid: 7
//!     ue_ip: 10.45.0.2
//!     upf_ip: 192.168.1.1
//! steps:
//!   - uplink: { len: 100, teid: 42 }
//!   - uplink: { len: 50, teid: 42, core: 1, ret: -22 }
//!   - downlink: { len: 200, ue_ip: 10.45.0.2 }
//!   - toggle: { flag: drop_tracing, enabled: true }
//!   - free: { len: 64 }
//! ```
//!
//! Every packet step fires the entry hook, then the matching return hook with
//! `ret` (default: success). The report holds the final counters and every
//! event left in the rings.

use super::{HostDatapath, SkbImage};
use crate::config::{MonitorConfig, Toggles};
use crate::control::{apply_toggles, ControlPlane};
use crate::ebpf::events::{events_from, MonitorEvent};
use crate::metrics::snapshot::CounterSnapshot;
use crate::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;
use upf_common::probe::{self, Skip};
use upf_common::reason::NETDEV_TX_OK;
use upf_common::{ConfigFlag, SessionInfo};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(default)]
    pub toggles: Toggles,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_cores() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionEntry {
    pub teid: u32,
    #[serde(default)]
    pub seid: u64,
    pub ue_ip: Ipv4Addr,
    pub upf_ip: Ipv4Addr,
    #[serde(default)]
    pub created_at_ns: u64,
}

impl From<&SessionEntry> for SessionInfo {
    fn from(entry: &SessionEntry) -> Self {
        SessionInfo {
            seid: entry.seid,
            ue_ip: u32::from(entry.ue_ip),
            upf_ip: u32::from(entry.upf_ip),
            created_at_ns: entry.created_at_ns,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// `gtp5g_encap_recv` entry and return
    Uplink(UplinkStep),
    /// `gtp5g_dev_xmit` entry and return
    Downlink(DownlinkStep),
    /// `skb/kfree_skb`
    Free(FreeStep),
    /// `ip_forward` entry and return
    Forward(GatedStep),
    /// `nf_hook_slow` entry and return
    Netfilter(GatedStep),
    Toggle(ToggleStep),
    Session(SessionEntry),
    EndSession(EndSessionStep),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UplinkStep {
    #[serde(default)]
    pub core: usize,
    pub len: u32,
    /// 0 writes a zero TEID into the GTP-U header
    #[serde(default)]
    pub teid: u32,
    /// Overrides the transport header offset. 0 reads as "no transport header".
    #[serde(default)]
    pub transport_header: Option<u16>,
    #[serde(default)]
    pub ret: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownlinkStep {
    #[serde(default)]
    pub core: usize,
    pub len: u32,
    /// Without an address the payload pointer is NULL
    #[serde(default)]
    pub ue_ip: Option<Ipv4Addr>,
    #[serde(default = "default_xmit_ret")]
    pub ret: i32,
}

fn default_xmit_ret() -> i32 {
    NETDEV_TX_OK
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreeStep {
    #[serde(default)]
    pub core: usize,
    pub len: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatedStep {
    #[serde(default)]
    pub core: usize,
    pub len: u32,
    #[serde(default)]
    pub ret: i32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagName {
    DetailedTracing,
    DropTracing,
    NetfilterTracing,
}

impl From<FlagName> for ConfigFlag {
    fn from(name: FlagName) -> Self {
        match name {
            FlagName::DetailedTracing => ConfigFlag::DetailedTracing,
            FlagName::DropTracing => ConfigFlag::DropTracing,
            FlagName::NetfilterTracing => ConfigFlag::NetfilterTracing,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleStep {
    pub flag: FlagName,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndSessionStep {
    pub teid: u32,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(contents)?;
        if scenario.cores == 0 {
            return Err(MonitorError::ConfigError(
                "scenario cores must be greater than 0".to_string(),
            ));
        }
        Ok(scenario)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub counters: CounterSnapshot,
    pub events: Vec<MonitorEvent>,
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.counters)?;
        writeln!(f, "events ({}):", self.events.len())?;
        for event in &self.events {
            writeln!(f, "  {}", event)?;
        }
        Ok(())
    }
}

/// Run `scenario` on a fresh datapath built from `config`
pub fn run(scenario: &Scenario, config: &MonitorConfig) -> Result<ReplayReport> {
    let mut dp = HostDatapath::from_config(scenario.cores, config);
    apply_toggles(&mut dp, &scenario.toggles)?;
    for session in &scenario.sessions {
        dp.upsert_session(session.teid, session.into())?;
    }

    for (index, step) in scenario.steps.iter().enumerate() {
        let outcome = run_step(&mut dp, step)?;
        debug!(step = index, ?outcome, "replayed step");
    }

    let mut events = events_from(dp.drain_drops(usize::MAX));
    events.extend(events_from(dp.drain_traces(usize::MAX)));
    events.sort_by_key(MonitorEvent::timestamp_ns);

    Ok(ReplayReport {
        counters: dp.snapshot(),
        events,
    })
}

/// Entry outcome of the step, for logging
fn run_step(dp: &mut HostDatapath, step: &Step) -> Result<std::result::Result<(), Skip>> {
    let outcome = match step {
        Step::Uplink(step) => {
            let mut image = SkbImage::uplink(step.len, step.teid);
            if let Some(offset) = step.transport_header {
                image = image.with_transport_header(offset);
            }
            let skb = dp.place(&image);
            let core = dp.core(step.core);
            let outcome = probe::encap_recv(&core, skb);
            let _ = probe::encap_recv_return(&core, step.ret);
            outcome
        }
        Step::Downlink(step) => {
            let image = match step.ue_ip {
                Some(ue_ip) => SkbImage::downlink(step.len, ue_ip),
                None => SkbImage::bare(step.len),
            };
            let skb = dp.place(&image);
            let core = dp.core(step.core);
            let outcome = probe::dev_xmit(&core, skb);
            let _ = probe::dev_xmit_return(&core, step.ret);
            outcome
        }
        Step::Free(step) => {
            let skb = dp.place(&SkbImage::bare(step.len));
            probe::free_skb(&dp.core(step.core), || Some(skb))
        }
        Step::Forward(step) => {
            let skb = dp.place(&SkbImage::bare(step.len));
            let core = dp.core(step.core);
            let outcome = probe::forward(&core, || Some(skb));
            let _ = probe::forward_return(&core, step.ret);
            outcome
        }
        Step::Netfilter(step) => {
            let skb = dp.place(&SkbImage::bare(step.len));
            let core = dp.core(step.core);
            let outcome = probe::netfilter(&core, || Some(skb));
            let _ = probe::netfilter_return(&core, step.ret);
            outcome
        }
        Step::Toggle(step) => {
            dp.set_flag(step.flag.into(), step.enabled)?;
            Ok(())
        }
        Step::Session(entry) => {
            dp.upsert_session(entry.teid, entry.into())?;
            Ok(())
        }
        Step::EndSession(step) => {
            dp.remove_session(step.teid)?;
            Ok(())
        }
    };
    Ok(outcome)
}
