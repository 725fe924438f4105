//! Runtime toggle registry layout
//!
//! The `AGENT_CONFIG` array has four `u32` slots. A non-zero value enables the
//! feature. Userspace may rewrite a slot at any time and probes tolerate
//! stale reads.

/// Slot index in the toggle registry
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigFlag {
    /// Emit a `PacketTraceEvent` for every accounted GTP packet
    DetailedTracing = 0,
    /// Enable the `kfree_skb` free-path probe
    DropTracing = 1,
    /// Enable the `ip_forward` and `nf_hook_slow` probes
    NetfilterTracing = 2,
    Reserved = 3,
}

impl ConfigFlag {
    pub const SLOTS: u32 = 4;

    pub const ALL: [ConfigFlag; 4] = [
        ConfigFlag::DetailedTracing,
        ConfigFlag::DropTracing,
        ConfigFlag::NetfilterTracing,
        ConfigFlag::Reserved,
    ];

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self as u32
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ConfigFlag::DetailedTracing => "detailed_tracing",
            ConfigFlag::DropTracing => "drop_tracing",
            ConfigFlag::NetfilterTracing => "netfilter_tracing",
            ConfigFlag::Reserved => "reserved",
        }
    }
}
