//! Simulated kernel address space
//!
//! Probes only see kernel memory through fallible reads. [`SimMemory`] maps
//! byte regions at fake kernel addresses and fails any read that is not fully
//! inside one region, which is how a bad pointer looks to
//! `bpf_probe_read_kernel`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use upf_common::skb::{GTP_TEID_OFFSET, IPV4_DST_OFFSET, IPV4_MIN_HEADER_LEN, UDP_HEADER_LEN};
use upf_common::SkbLayout;

/// First mapped address, in the x86_64 direct map range
const BASE_ADDRESS: u64 = 0xffff_8880_0000_0000;
/// Regions never share a page
const REGION_ALIGN: u64 = 4096;
/// Ethernet + minimal IPv4 header in front of the outer UDP header
pub const DEFAULT_TRANSPORT_OFFSET: u16 = 14 + 20;

pub struct SimMemory {
    regions: RwLock<BTreeMap<u64, Vec<u8>>>,
    next: AtomicU64,
}

impl Default for SimMemory {
    fn default() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            next: AtomicU64::new(BASE_ADDRESS),
        }
    }
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at a fresh address and return it
    pub fn map(&self, bytes: Vec<u8>) -> u64 {
        let span = (bytes.len() as u64 / REGION_ALIGN + 1) * REGION_ALIGN;
        let addr = self.next.fetch_add(span, Ordering::Relaxed);
        self.regions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr, bytes);
        addr
    }

    /// Copy `N` bytes at `addr`, or `None` if any of them is unmapped
    pub fn read<const N: usize>(&self, addr: u64) -> Option<[u8; N]> {
        let regions = self.regions.read().ok()?;
        let (base, bytes) = regions.range(..=addr).next_back()?;
        let start = usize::try_from(addr - base).ok()?;
        let end = start.checked_add(N)?;
        bytes.get(start..end)?.try_into().ok()
    }

    /// Lay out a packet descriptor described by `image` and return its address
    pub fn place(&self, image: &SkbImage, layout: &SkbLayout) -> u64 {
        let head = match image.buffer() {
            Some(buffer) => self.map(buffer),
            None => 0,
        };
        let data = match image.payload {
            Payload::Gtp { .. } if head != 0 => head + image.transport_header as u64,
            Payload::Inner { .. } if head != 0 => head,
            _ => 0,
        };

        let size = [layout.len, layout.head, layout.data, layout.transport_header]
            .into_iter()
            .max()
            .unwrap_or(0) as usize
            + 8;
        let mut skb = vec![0u8; size];
        write_at(&mut skb, layout.len, &image.len.to_ne_bytes());
        write_at(&mut skb, layout.head, &head.to_ne_bytes());
        write_at(&mut skb, layout.data, &data.to_ne_bytes());
        write_at(
            &mut skb,
            layout.transport_header,
            &image.transport_header.to_ne_bytes(),
        );
        self.map(skb)
    }
}

fn write_at(buffer: &mut [u8], offset: u32, bytes: &[u8]) {
    let start = offset as usize;
    buffer[start..start + bytes.len()].copy_from_slice(bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    /// Nothing behind `head`/`data`
    Missing,
    /// Outer UDP + GTP-U header at the transport offset
    Gtp { teid: u32 },
    /// Inner IPv4 header at `data`
    Inner { destination: Ipv4Addr },
}

/// Builder for a synthetic `struct sk_buff`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkbImage {
    len: u32,
    transport_header: u16,
    payload: Payload,
}

impl SkbImage {
    /// GTP-U packet as seen by `gtp5g_encap_recv`
    pub fn uplink(len: u32, teid: u32) -> Self {
        Self {
            len,
            transport_header: DEFAULT_TRANSPORT_OFFSET,
            payload: Payload::Gtp { teid },
        }
    }

    /// Inner IPv4 packet as seen by `gtp5g_dev_xmit`
    pub fn downlink(len: u32, destination: Ipv4Addr) -> Self {
        Self {
            len,
            transport_header: 0,
            payload: Payload::Inner { destination },
        }
    }

    /// Only the length is readable, `head` and `data` are NULL
    pub fn bare(len: u32) -> Self {
        Self {
            len,
            transport_header: 0,
            payload: Payload::Missing,
        }
    }

    pub fn with_transport_header(mut self, offset: u16) -> Self {
        self.transport_header = offset;
        self
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Only the header bytes a probe reads are backed, whatever `len` says
    fn buffer(&self) -> Option<Vec<u8>> {
        match self.payload {
            Payload::Missing => None,
            Payload::Gtp { teid } => {
                let at =
                    (self.transport_header as u64 + UDP_HEADER_LEN + GTP_TEID_OFFSET) as usize;
                let mut buffer = vec![0u8; at + 4];
                buffer[at..at + 4].copy_from_slice(&teid.to_be_bytes());
                Some(buffer)
            }
            Payload::Inner { destination } => {
                let dst_at = IPV4_DST_OFFSET as usize;
                let mut buffer = vec![0u8; IPV4_MIN_HEADER_LEN as usize];
                buffer[0] = 0x45;
                buffer[dst_at..dst_at + 4].copy_from_slice(&destination.octets());
                Some(buffer)
            }
        }
    }
}
