//! Checks that the system can run the probes before anything is loaded

use crate::{MonitorError, Result};
use std::path::Path;
use tracing::{info, warn};

/// Ring buffer maps need 5.8
const MIN_KERNEL: (u32, u32) = (5, 8);

pub fn run_preflight_checks() -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version()?;
    check_btf();
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

fn check_kernel_version() -> Result<()> {
    let output = std::process::Command::new("uname").arg("-r").output()?;
    let release = String::from_utf8_lossy(&output.stdout).trim().to_string();

    let version = parse_kernel_version(&release).ok_or_else(|| {
        MonitorError::UnsupportedFeature(format!("could not parse kernel version {:?}", release))
    })?;

    if version < MIN_KERNEL {
        return Err(MonitorError::KernelVersionTooOld {
            version: release,
            min_version: format!("{}.{}", MIN_KERNEL.0, MIN_KERNEL.1),
        });
    }

    info!("Kernel version: {} (supported)", release);
    Ok(())
}

/// `major.minor` of a `uname -r` string such as `5.15.0-91-generic`
pub fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_btf() {
    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not found at /sys/kernel/btf/vmlinux");
        warn!("skb offsets come from configuration only. Check skb_layout matches this kernel.");
        return;
    }

    info!("BTF available");
}

fn check_capabilities() {
    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!(
            "Not running as root (euid={}). Ensure CAP_BPF, CAP_PERFMON and CAP_SYS_ADMIN are granted.",
            euid
        );
    } else {
        info!("Running with root privileges");
    }
}
