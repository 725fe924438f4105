//! `struct sk_buff` field offsets and GTP-U header geometry
//!
//! Field offsets differ between kernel builds, so the loader writes the
//! offsets for the running kernel into the `SKB_LAYOUT` map before any probe
//! is attached. The defaults match x86_64 5.15 through 6.x builds.

/// UDP header length, the GTP-U header starts right after it
pub const UDP_HEADER_LEN: u64 = 8;
/// Offset of the TEID inside the GTP-U header
pub const GTP_TEID_OFFSET: u64 = 4;
/// Minimal IPv4 header length
pub const IPV4_MIN_HEADER_LEN: u32 = 20;
/// Offset of the destination address inside an IPv4 header
pub const IPV4_DST_OFFSET: u64 = 16;
/// Buffers shorter than this on the free path are treated as noise
pub const MIN_PLAUSIBLE_PACKET_LEN: u32 = 20;
/// Offset of `skbaddr` in the `skb/kfree_skb` tracepoint record
pub const KFREE_SKB_SKBADDR_OFFSET: usize = 8;

/// Byte offsets of the `sk_buff` fields the probes read
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct SkbLayout {
    /// `unsigned int len`
    pub len: u32,
    /// `unsigned char *head`
    pub head: u32,
    /// `unsigned char *data`
    pub data: u32,
    /// `__u16 transport_header`, relative to `head`
    pub transport_header: u32,
}

impl SkbLayout {
    pub const DEFAULT: SkbLayout = SkbLayout {
        len: 112,
        head: 200,
        data: 208,
        transport_header: 180,
    };
}

impl Default for SkbLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
