//! Monitor configuration
//!
//! Loaded from an optional YAML file. Every field has a default, so an empty
//! file (or no file) gives a working setup. Command line flags are applied on
//! top with [`MonitorConfig::apply_overrides`].

use crate::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use upf_common::maps::{DROP_RING_BYTES, KEYED_TABLE_CAPACITY, TRACE_RING_BYTES};
use upf_common::{ConfigFlag, SkbLayout};

/// Ring sizes must be a whole number of pages
const PAGE_SIZE: u32 = 4096;
/// Upper bound for any `struct sk_buff` field offset
pub const MAX_SKB_OFFSET: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub toggles: Toggles,
    /// How often the event rings are drained
    pub poll_interval_ms: u64,
    /// How often counters and tallies are logged
    pub report_interval_secs: u64,
    /// Maximum records drained from one ring per poll
    pub max_batch: usize,
    pub tables: TableCapacities,
    pub rings: RingSizes,
    pub skb_layout: SkbOffsets,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            toggles: Toggles::default(),
            poll_interval_ms: 100,
            report_interval_secs: 10,
            max_batch: 1024,
            tables: TableCapacities::default(),
            rings: RingSizes::default(),
            skb_layout: SkbOffsets::default(),
        }
    }
}

/// Initial values of the runtime toggle registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Toggles {
    pub detailed_tracing: bool,
    pub drop_tracing: bool,
    pub netfilter_tracing: bool,
}

impl Toggles {
    pub fn get(&self, flag: ConfigFlag) -> bool {
        match flag {
            ConfigFlag::DetailedTracing => self.detailed_tracing,
            ConfigFlag::DropTracing => self.drop_tracing,
            ConfigFlag::NetfilterTracing => self.netfilter_tracing,
            ConfigFlag::Reserved => false,
        }
    }

    pub fn set(&mut self, flag: ConfigFlag, enabled: bool) {
        match flag {
            ConfigFlag::DetailedTracing => self.detailed_tracing = enabled,
            ConfigFlag::DropTracing => self.drop_tracing = enabled,
            ConfigFlag::NetfilterTracing => self.netfilter_tracing = enabled,
            ConfigFlag::Reserved => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableCapacities {
    pub tunnels: u32,
    pub subscribers: u32,
    pub sessions: u32,
}

impl Default for TableCapacities {
    fn default() -> Self {
        Self {
            tunnels: KEYED_TABLE_CAPACITY,
            subscribers: KEYED_TABLE_CAPACITY,
            sessions: KEYED_TABLE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RingSizes {
    pub drop_bytes: u32,
    pub trace_bytes: u32,
}

impl Default for RingSizes {
    fn default() -> Self {
        Self {
            drop_bytes: DROP_RING_BYTES,
            trace_bytes: TRACE_RING_BYTES,
        }
    }
}

/// `struct sk_buff` offsets for the running kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkbOffsets {
    pub len: u32,
    pub head: u32,
    pub data: u32,
    pub transport_header: u32,
}

impl Default for SkbOffsets {
    fn default() -> Self {
        let SkbLayout {
            len,
            head,
            data,
            transport_header,
        } = SkbLayout::DEFAULT;
        Self {
            len,
            head,
            data,
            transport_header,
        }
    }
}

impl From<SkbOffsets> for SkbLayout {
    fn from(offsets: SkbOffsets) -> Self {
        SkbLayout {
            len: offsets.len,
            head: offsets.head,
            data: offsets.data,
            transport_header: offsets.transport_header,
        }
    }
}

/// Command line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub detailed_tracing: bool,
    pub drop_tracing: bool,
    pub netfilter_tracing: bool,
    pub poll_interval_ms: Option<u64>,
}

impl MonitorConfig {
    /// Read and validate a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML text. An empty document gives the defaults.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: MonitorConfig = if contents.trim().is_empty() {
            MonitorConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// The file, or the defaults when no file is given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(config_error("poll_interval_ms must be greater than 0"));
        }
        if self.report_interval_secs == 0 {
            return Err(config_error("report_interval_secs must be greater than 0"));
        }
        if self.max_batch == 0 {
            return Err(config_error("max_batch must be greater than 0"));
        }

        for (name, capacity) in [
            ("tables.tunnels", self.tables.tunnels),
            ("tables.subscribers", self.tables.subscribers),
            ("tables.sessions", self.tables.sessions),
        ] {
            if capacity == 0 {
                return Err(config_error(&format!("{} must be greater than 0", name)));
            }
        }

        for (name, bytes) in [
            ("rings.drop_bytes", self.rings.drop_bytes),
            ("rings.trace_bytes", self.rings.trace_bytes),
        ] {
            if !bytes.is_power_of_two() || bytes % PAGE_SIZE != 0 {
                return Err(config_error(&format!(
                    "{} must be a power of two and a multiple of {} (got {})",
                    name, PAGE_SIZE, bytes
                )));
            }
        }

        if self.skb_layout.len == 0 {
            return Err(config_error("skb_layout.len must not be 0"));
        }
        for (name, offset) in [
            ("skb_layout.len", self.skb_layout.len),
            ("skb_layout.head", self.skb_layout.head),
            ("skb_layout.data", self.skb_layout.data),
            ("skb_layout.transport_header", self.skb_layout.transport_header),
        ] {
            if offset >= MAX_SKB_OFFSET {
                return Err(config_error(&format!(
                    "{} must be below {} (got {})",
                    name, MAX_SKB_OFFSET, offset
                )));
            }
        }

        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Result<()> {
        // Flags only ever switch a toggle on
        if overrides.detailed_tracing {
            self.toggles.detailed_tracing = true;
        }
        if overrides.drop_tracing {
            self.toggles.drop_tracing = true;
        }
        if overrides.netfilter_tracing {
            self.toggles.netfilter_tracing = true;
        }
        if let Some(poll) = overrides.poll_interval_ms {
            self.poll_interval_ms = poll;
        }
        self.validate()
    }

    pub fn skb_layout(&self) -> SkbLayout {
        self.skb_layout.into()
    }
}

fn config_error(message: &str) -> MonitorError {
    MonitorError::ConfigError(message.to_string())
}
