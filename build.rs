use anyhow::{anyhow, Context};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Name of the probe binary in upf-probes, and of the object in OUT_DIR
const PROBES_BIN: &str = "upf_monitor";

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-changed=upf-probes/src");
    println!("cargo:rerun-if-changed=upf-common/src");
    println!("cargo:rerun-if-env-changed=CI");

    // Skip eBPF build if we're already building for the eBPF target
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default() == "bpf" {
        return Ok(());
    }

    let object = PathBuf::from(env::var("OUT_DIR")?).join(PROBES_BIN);

    // Skip eBPF build on non-Linux platforms
    if env::consts::OS != "linux" {
        println!(
            "cargo:warning=eBPF compilation skipped on {}. `upf-monitor run` will be unavailable.",
            env::consts::OS
        );
        return write_placeholder(&object);
    }

    // Skip eBPF build in CI (no bpf-linker available)
    if env::var("CI").is_ok() {
        println!("cargo:warning=eBPF compilation skipped in CI. Use dedicated eBPF build job.");
        return write_placeholder(&object);
    }

    if Command::new("bpf-linker").arg("--version").output().is_err() {
        println!("cargo:warning=bpf-linker not found, eBPF compilation skipped.");
        return write_placeholder(&object);
    }

    let aya_build::cargo_metadata::Metadata { packages, .. } =
        aya_build::cargo_metadata::MetadataCommand::new()
            .no_deps()
            .exec()
            .context("MetadataCommand::exec")?;

    let ebpf_package = packages
        .into_iter()
        .find(|pkg| pkg.name == "upf-probes")
        .ok_or_else(|| anyhow!("upf-probes package not found"))?;

    aya_build::build_ebpf([ebpf_package])?;

    if !object.exists() {
        return Err(anyhow!(
            "eBPF probe compilation failed: {} not found",
            object.display()
        ));
    }

    Ok(())
}

/// An empty object lets the crate compile. The loader reports it as
/// "probes not built" at runtime.
fn write_placeholder(object: &Path) -> anyhow::Result<()> {
    fs::write(object, b"")
        .with_context(|| format!("writing placeholder {}", object.display()))?;
    Ok(())
}
