//! Userspace side of the eBPF probes: the hook registry, event decoding and,
//! on Linux, loading, attaching and map access.

pub mod events;
pub mod kallsyms;
#[cfg(target_os = "linux")]
pub mod loader;
#[cfg(target_os = "linux")]
pub mod maps;
#[cfg(target_os = "linux")]
pub mod preflight;

use std::fmt;
use upf_common::ConfigFlag;

/// How a program observes its kernel function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// kprobe, fires on function entry
    Entry,
    /// kretprobe, fires on return and sees the return code
    Return,
    /// tracepoint, fires once per event with no return path
    Standalone,
}

impl HookKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HookKind::Entry => "entry",
            HookKind::Return => "return",
            HookKind::Standalone => "standalone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTarget {
    /// Kernel function symbol
    Kprobe(&'static str),
    Tracepoint {
        category: &'static str,
        name: &'static str,
    },
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookTarget::Kprobe(symbol) => write!(f, "{}", symbol),
            HookTarget::Tracepoint { category, name } => write!(f, "{}/{}", category, name),
        }
    }
}

/// One program in the probe object and where it attaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookPoint {
    /// Program name in the eBPF object
    pub program: &'static str,
    pub target: HookTarget,
    pub kind: HookKind,
    /// A required hook that cannot attach aborts startup
    pub required: bool,
    /// Toggle checked first by the program, if any
    pub gate: Option<ConfigFlag>,
}

impl HookPoint {
    const fn kprobe(
        program: &'static str,
        symbol: &'static str,
        kind: HookKind,
        required: bool,
        gate: Option<ConfigFlag>,
    ) -> Self {
        Self {
            program,
            target: HookTarget::Kprobe(symbol),
            kind,
            required,
            gate,
        }
    }

    /// The kprobe symbol, if this hook is a kprobe or kretprobe
    pub fn symbol(&self) -> Option<&'static str> {
        match self.target {
            HookTarget::Kprobe(symbol) => Some(symbol),
            HookTarget::Tracepoint { .. } => None,
        }
    }

    /// The other half of an entry/return pair
    pub fn partner(&self) -> Option<&'static HookPoint> {
        let wanted = match self.kind {
            HookKind::Entry => HookKind::Return,
            HookKind::Return => HookKind::Entry,
            HookKind::Standalone => return None,
        };
        HOOK_POINTS
            .iter()
            .find(|hook| hook.kind == wanted && hook.target == self.target)
    }
}

/// Every program in the probe object, in attach order. An entry probe is
/// attached before its return probe.
pub static HOOK_POINTS: [HookPoint; 9] = [
    HookPoint::kprobe(
        "kprobe_gtp5g_encap_recv",
        "gtp5g_encap_recv",
        HookKind::Entry,
        true,
        None,
    ),
    HookPoint::kprobe(
        "kretprobe_gtp5g_encap_recv",
        "gtp5g_encap_recv",
        HookKind::Return,
        true,
        None,
    ),
    HookPoint::kprobe(
        "kprobe_gtp5g_dev_xmit",
        "gtp5g_dev_xmit",
        HookKind::Entry,
        true,
        None,
    ),
    HookPoint::kprobe(
        "kretprobe_gtp5g_dev_xmit",
        "gtp5g_dev_xmit",
        HookKind::Return,
        true,
        None,
    ),
    HookPoint {
        program: "tracepoint_kfree_skb",
        target: HookTarget::Tracepoint {
            category: "skb",
            name: "kfree_skb",
        },
        kind: HookKind::Standalone,
        required: false,
        gate: Some(ConfigFlag::DropTracing),
    },
    HookPoint::kprobe(
        "kprobe_ip_forward",
        "ip_forward",
        HookKind::Entry,
        false,
        Some(ConfigFlag::NetfilterTracing),
    ),
    HookPoint::kprobe(
        "kretprobe_ip_forward",
        "ip_forward",
        HookKind::Return,
        false,
        Some(ConfigFlag::NetfilterTracing),
    ),
    HookPoint::kprobe(
        "kprobe_nf_hook_slow",
        "nf_hook_slow",
        HookKind::Entry,
        false,
        Some(ConfigFlag::NetfilterTracing),
    ),
    HookPoint::kprobe(
        "kretprobe_nf_hook_slow",
        "nf_hook_slow",
        HookKind::Return,
        false,
        Some(ConfigFlag::NetfilterTracing),
    ),
];
