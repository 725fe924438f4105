//! Control-side writers shared by the kernel maps and the host model
//!
//! The PFCP sniffer owns the session table and an external controller owns
//! the toggles. Both only need these three operations.

use crate::config::Toggles;
use crate::Result;
use upf_common::{ConfigFlag, SessionInfo};

pub trait ControlPlane {
    /// Write one toggle slot. Probes see the change on their next read.
    fn set_flag(&mut self, flag: ConfigFlag, enabled: bool) -> Result<()>;

    /// Create or replace the session bound to a TEID
    fn upsert_session(&mut self, tunnel_id: u32, session: SessionInfo) -> Result<()>;

    fn remove_session(&mut self, tunnel_id: u32) -> Result<()>;
}

/// Write every toggle slot, the reserved one included, so no stale value
/// from a previous run survives.
pub fn apply_toggles<C: ControlPlane + ?Sized>(control: &mut C, toggles: &Toggles) -> Result<()> {
    for flag in ConfigFlag::ALL {
        control.set_flag(flag, toggles.get(flag))?;
    }
    Ok(())
}
