use crate::cli::{Commands, OutputFormat};
use crate::config::MonitorConfig;
use crate::datapath::replay::{self, Scenario};
use crate::ebpf::HOOK_POINTS;
use crate::Result;
use std::path::Path;
use tracing::info;
use upf_common::DropReason;

pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> Result<()> {
    let mut config = MonitorConfig::load_or_default(config_path)?;
    config.apply_overrides(&command.overrides())?;

    match command {
        Commands::Run { .. } => handle_run(config).await,
        Commands::Hooks => {
            print!("{}", hooks_table());
            Ok(())
        }
        Commands::Reasons => {
            print!("{}", reasons_table());
            Ok(())
        }
        Commands::Replay { file, format } => handle_replay(&file, format, &config),
    }
}

#[cfg(target_os = "linux")]
async fn handle_run(config: MonitorConfig) -> Result<()> {
    use crate::ebpf::loader::ProbeManager;
    use crate::metrics::MetricsCollector;
    use std::time::Duration;
    use tracing::warn;

    let mut manager = ProbeManager::new(&config)?;
    let stats = manager.attach()?;
    info!("{} hooks attached", stats.attached());

    let mut rings = manager.take_rings()?;
    let collector = MetricsCollector::new();

    let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    let mut report = tokio::time::interval(Duration::from_secs(config.report_interval_secs));
    // The first tick completes immediately
    report.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Monitoring gtp5g traffic. Press Ctrl-C to stop.");
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down...");
                break;
            }
            _ = poll.tick() => {
                let events = rings.poll(config.max_batch);
                for event in &events {
                    info!("{}", event);
                }
                collector.process_batch(events).await;
            }
            _ = report.tick() => {
                report_status(&manager, &collector).await;
            }
        }
    }

    report_status(&manager, &collector).await;
    drop(rings);
    manager.unload();
    Ok(())
}

#[cfg(target_os = "linux")]
async fn report_status(
    manager: &crate::ebpf::loader::ProbeManager,
    collector: &crate::metrics::MetricsCollector,
) {
    match manager.counters() {
        Ok(counters) => {
            info!("uplink: {}", counters.uplink);
            info!("downlink: {}", counters.downlink);
            info!(
                tunnels = counters.tunnels.len(),
                subscribers = counters.subscribers.len(),
                "keyed counters"
            );
        }
        Err(e) => tracing::warn!("Failed to read counters: {}", e),
    }

    let metrics = collector.get_metrics().await;
    info!(
        drops = metrics.drops_total,
        uplink = metrics.uplink_drops,
        downlink = metrics.downlink_drops,
        traces = metrics.traces_total,
        "events"
    );
    for (reason, count) in &metrics.drops_by_reason {
        info!("  {}: {}", reason, count);
    }
}

#[cfg(not(target_os = "linux"))]
async fn handle_run(_config: MonitorConfig) -> Result<()> {
    Err(crate::MonitorError::UnsupportedFeature(
        "loading probes requires Linux. Use `replay` to exercise the datapath model.".to_string(),
    ))
}

fn handle_replay(file: &Path, format: OutputFormat, config: &MonitorConfig) -> Result<()> {
    info!("Replaying {}", file.display());
    let scenario = Scenario::load(file)?;
    let report = replay::run(&scenario, config)?;

    match format {
        OutputFormat::Text => print!("{}", report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

pub fn hooks_table() -> String {
    let mut out = format!(
        "{:<28} {:<20} {:<11} {:<9} {}\n",
        "PROGRAM", "TARGET", "KIND", "REQUIRED", "GATE"
    );
    for hook in HOOK_POINTS.iter() {
        out.push_str(&format!(
            "{:<28} {:<20} {:<11} {:<9} {}\n",
            hook.program,
            hook.target.to_string(),
            hook.kind.as_str(),
            if hook.required { "yes" } else { "no" },
            hook.gate.map_or("-", |flag| flag.as_str()),
        ));
    }
    out
}

pub fn reasons_table() -> String {
    let mut out = format!("{:<5} {}\n", "CODE", "REASON");
    for reason in DropReason::ALL {
        out.push_str(&format!("{:<5} {}\n", reason as u8, reason));
    }
    out
}
