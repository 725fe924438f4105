//! Drop reason taxonomy and return-code classification
//!
//! Every probe that can observe a drop maps its local signal (a return code,
//! or simply the fact that it fired) to exactly one [`DropReason`].

/// Errno values returned by `gtp5g_encap_recv` on the uplink path
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
}

/// `NETDEV_TX_OK`, the only accepted outcome of `gtp5g_dev_xmit`
pub const NETDEV_TX_OK: i32 = 0;

/// Closed set of drop causes. The discriminant is the wire code.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "userspace", derive(PartialOrd, Ord))]
pub enum DropReason {
    NoPdrMatch = 0,
    InvalidTeid = 1,
    QosViolation = 2,
    Kernel = 3,
    NoFarAction = 4,
    BufferOverflow = 5,
    TtlExpired = 6,
    MtuExceeded = 7,
    MalformedGtp = 8,
    NoTunnel = 9,
    EncapFailed = 10,
    DecapFailed = 11,
    Routing = 12,
    Policy = 13,
    Memory = 14,
}

/// Uplink return codes with a specific meaning, checked in order.
/// Any other negative code is a generic decapsulation failure.
const UPLINK_RETURN_CODES: [(i32, DropReason); 3] = [
    (-errno::ENOENT, DropReason::NoPdrMatch),
    (-errno::EINVAL, DropReason::InvalidTeid),
    (-errno::ENOMEM, DropReason::Memory),
];

impl DropReason {
    pub const ALL: [DropReason; 15] = [
        DropReason::NoPdrMatch,
        DropReason::InvalidTeid,
        DropReason::QosViolation,
        DropReason::Kernel,
        DropReason::NoFarAction,
        DropReason::BufferOverflow,
        DropReason::TtlExpired,
        DropReason::MtuExceeded,
        DropReason::MalformedGtp,
        DropReason::NoTunnel,
        DropReason::EncapFailed,
        DropReason::DecapFailed,
        DropReason::Routing,
        DropReason::Policy,
        DropReason::Memory,
    ];

    pub const fn from_u8(code: u8) -> Option<Self> {
        if (code as usize) < Self::ALL.len() {
            Some(Self::ALL[code as usize])
        } else {
            None
        }
    }

    /// Label used in logs and by dashboards
    pub const fn as_str(&self) -> &'static str {
        match self {
            DropReason::NoPdrMatch => "NO_PDR_MATCH",
            DropReason::InvalidTeid => "INVALID_TEID",
            DropReason::QosViolation => "QOS_VIOLATION",
            DropReason::Kernel => "KERNEL_DROP",
            DropReason::NoFarAction => "NO_FAR_ACTION",
            DropReason::BufferOverflow => "BUFFER_OVERFLOW",
            DropReason::TtlExpired => "TTL_EXPIRED",
            DropReason::MtuExceeded => "MTU_EXCEEDED",
            DropReason::MalformedGtp => "MALFORMED_GTP",
            DropReason::NoTunnel => "NO_GTP_TUNNEL",
            DropReason::EncapFailed => "ENCAP_FAILED",
            DropReason::DecapFailed => "DECAP_FAILED",
            DropReason::Routing => "ROUTING_DROP",
            DropReason::Policy => "POLICY_DROP",
            DropReason::Memory => "MEMORY_ERROR",
        }
    }
}

#[cfg(feature = "userspace")]
impl core::fmt::Display for DropReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the return value of `gtp5g_encap_recv`.
#[inline(always)]
pub fn classify_uplink(ret: i32) -> Option<DropReason> {
    if ret >= 0 {
        return None;
    }
    for (code, reason) in UPLINK_RETURN_CODES {
        if ret == code {
            return Some(reason);
        }
    }
    Some(DropReason::DecapFailed)
}

/// Classify the return value of `gtp5g_dev_xmit`.
#[inline(always)]
pub fn classify_downlink(ret: i32) -> Option<DropReason> {
    if ret != NETDEV_TX_OK {
        Some(DropReason::EncapFailed)
    } else {
        None
    }
}

/// Classify the return value of `ip_forward` (`NET_RX_SUCCESS` is 0).
#[inline(always)]
pub fn classify_forward(ret: i32) -> Option<DropReason> {
    if ret != 0 {
        Some(DropReason::Routing)
    } else {
        None
    }
}

/// Classify the return value of `nf_hook_slow`.
///
/// 1 means accepted, 0 means stolen or queued, and a negative errno means the
/// ruleset dropped the packet.
#[inline(always)]
pub fn classify_netfilter(ret: i32) -> Option<DropReason> {
    if ret < 0 {
        Some(DropReason::Policy)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uplink_known_codes() {
        assert_eq!(classify_uplink(-2), Some(DropReason::NoPdrMatch));
        assert_eq!(classify_uplink(-22), Some(DropReason::InvalidTeid));
        assert_eq!(classify_uplink(-12), Some(DropReason::Memory));
    }

    #[test]
    fn test_uplink_unknown_negative_is_decap_failure() {
        assert_eq!(classify_uplink(-1), Some(DropReason::DecapFailed));
        assert_eq!(classify_uplink(-105), Some(DropReason::DecapFailed));
        assert_eq!(classify_uplink(i32::MIN), Some(DropReason::DecapFailed));
    }

    #[test]
    fn test_uplink_non_negative_is_not_a_drop() {
        assert_eq!(classify_uplink(0), None);
        assert_eq!(classify_uplink(1), None);
    }

    #[test]
    fn test_downlink_anything_but_tx_ok_is_encap_failure() {
        assert_eq!(classify_downlink(NETDEV_TX_OK), None);
        assert_eq!(classify_downlink(0x10), Some(DropReason::EncapFailed));
        assert_eq!(classify_downlink(-1), Some(DropReason::EncapFailed));
    }

    #[test]
    fn test_forward_and_netfilter() {
        assert_eq!(classify_forward(0), None);
        assert_eq!(classify_forward(1), Some(DropReason::Routing));
        assert_eq!(classify_netfilter(1), None);
        assert_eq!(classify_netfilter(0), None);
        assert_eq!(classify_netfilter(-1), Some(DropReason::Policy));
    }

    #[test]
    fn test_wire_codes_round_trip_through_table() {
        for (code, reason) in DropReason::ALL.iter().enumerate() {
            assert_eq!(*reason as u8 as usize, code);
            assert_eq!(DropReason::from_u8(code as u8), Some(*reason));
        }
        assert_eq!(DropReason::from_u8(15), None);
    }

    #[test]
    fn test_labels_are_unique() {
        let mut labels: Vec<_> = DropReason::ALL.iter().map(|r| r.as_str()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), DropReason::ALL.len());
    }
}
