//! UPF monitor probes
//!
//! Attaches to the gtp5g kernel module and a few generic kernel paths:
//! - kprobe/kretprobe on `gtp5g_encap_recv` (uplink) and `gtp5g_dev_xmit` (downlink)
//! - tracepoint `skb/kfree_skb` (generic drops, gated by drop tracing)
//! - kprobe/kretprobe on `ip_forward` and `nf_hook_slow` (gated by netfilter tracing)
//!
//! Every probe returns 0 whatever happens. All logic lives in
//! `upf_common::probe`.
//!
//! Note: This binary must be built for the bpfel-unknown-none target.
//! The root crate's build.rs handles cross-compilation.

#![no_std]
#![no_main]

use aya_ebpf::{
    macros::{kprobe, kretprobe, tracepoint},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use aya_log_ebpf::debug;
use upf_common::probe::{self, ProbeResult, Skip};
use upf_common::skb::KFREE_SKB_SKBADDR_OFFSET;
use upf_probes::Kernel;

// int gtp5g_encap_recv(struct sock *sk, struct sk_buff *skb)
#[kprobe]
pub fn kprobe_gtp5g_encap_recv(ctx: ProbeContext) -> u32 {
    match try_encap_recv(&ctx) {
        Err(Skip::Full) => {
            debug!(&ctx, "uplink: teid table or trace ring full");
            0
        }
        Ok(()) | Err(_) => 0,
    }
}

fn try_encap_recv(ctx: &ProbeContext) -> ProbeResult {
    let skb: *const u8 = ctx.arg(1).ok_or(Skip::Unreadable)?;
    probe::encap_recv(&Kernel, skb as u64)
}

#[kretprobe]
pub fn kretprobe_gtp5g_encap_recv(ctx: RetProbeContext) -> u32 {
    let ret: i32 = ctx.ret().unwrap_or(0);
    match probe::encap_recv_return(&Kernel, ret) {
        Ok(()) | Err(_) => 0,
    }
}

// netdev_tx_t gtp5g_dev_xmit(struct sk_buff *skb, struct net_device *dev)
#[kprobe]
pub fn kprobe_gtp5g_dev_xmit(ctx: ProbeContext) -> u32 {
    match try_dev_xmit(&ctx) {
        Err(Skip::Full) => {
            debug!(&ctx, "downlink: ue ip table or trace ring full");
            0
        }
        Ok(()) | Err(_) => 0,
    }
}

fn try_dev_xmit(ctx: &ProbeContext) -> ProbeResult {
    let skb: *const u8 = ctx.arg(0).ok_or(Skip::Unreadable)?;
    probe::dev_xmit(&Kernel, skb as u64)
}

#[kretprobe]
pub fn kretprobe_gtp5g_dev_xmit(ctx: RetProbeContext) -> u32 {
    let ret: i32 = ctx.ret().unwrap_or(0);
    match probe::dev_xmit_return(&Kernel, ret) {
        Ok(()) | Err(_) => 0,
    }
}

#[tracepoint]
pub fn tracepoint_kfree_skb(ctx: TracePointContext) -> u32 {
    // The skbaddr read is deferred until the drop tracing toggle has been
    // checked.
    let skbaddr = || unsafe { ctx.read_at::<u64>(KFREE_SKB_SKBADDR_OFFSET) }.ok();
    match probe::free_skb(&Kernel, skbaddr) {
        Ok(()) | Err(_) => 0,
    }
}

// int ip_forward(struct sk_buff *skb)
#[kprobe]
pub fn kprobe_ip_forward(ctx: ProbeContext) -> u32 {
    let skb = || ctx.arg::<*const u8>(0).map(|p| p as u64);
    match probe::forward(&Kernel, skb) {
        Ok(()) | Err(_) => 0,
    }
}

#[kretprobe]
pub fn kretprobe_ip_forward(ctx: RetProbeContext) -> u32 {
    let ret: i32 = ctx.ret().unwrap_or(0);
    match probe::forward_return(&Kernel, ret) {
        Ok(()) | Err(_) => 0,
    }
}

// int nf_hook_slow(struct sk_buff *skb, struct nf_hook_state *state, ...)
#[kprobe]
pub fn kprobe_nf_hook_slow(ctx: ProbeContext) -> u32 {
    let skb = || ctx.arg::<*const u8>(0).map(|p| p as u64);
    match probe::netfilter(&Kernel, skb) {
        Ok(()) | Err(_) => 0,
    }
}

#[kretprobe]
pub fn kretprobe_nf_hook_slow(ctx: RetProbeContext) -> u32 {
    // 1 means accepted, so a missing return value must not look like a drop
    let ret: i32 = ctx.ret().unwrap_or(1);
    match probe::netfilter_return(&Kernel, ret) {
        Ok(()) | Err(_) => 0,
    }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
