use clap::Parser;
use std::io::Write;
use upf_monitor::cli::{Cli, Commands, OutputFormat};
use upf_monitor::config::MonitorConfig;
use upf_monitor::error::{MonitorError, Result};

#[test]
fn test_error_types() {
    let err = MonitorError::AttachFailed {
        program: "kprobe_gtp5g_encap_recv".to_string(),
        target: "gtp5g_encap_recv".to_string(),
        reason: "no such symbol".to_string(),
    };

    assert!(err.to_string().contains("kprobe_gtp5g_encap_recv"));
    assert!(err.to_string().contains("gtp5g_encap_recv"));
}

#[test]
fn test_result_type() {
    fn returns_result() -> Result<u32> {
        Ok(42)
    }

    assert_eq!(returns_result().unwrap(), 42);
}

#[test]
fn test_version_const() {
    assert!(!upf_monitor::VERSION.is_empty());
}

#[test]
fn test_cli_run_flags_override_config() {
    let cli = Cli::try_parse_from([
        "upf-monitor",
        "--verbose",
        "run",
        "--drop-tracing",
        "--poll-interval-ms",
        "250",
    ])
    .unwrap();
    assert!(cli.verbose);

    let command = cli.command.unwrap();
    assert!(matches!(command, Commands::Run { .. }));

    let mut config = MonitorConfig::default();
    config.apply_overrides(&command.overrides()).unwrap();
    assert!(config.toggles.drop_tracing);
    assert!(!config.toggles.detailed_tracing);
    assert_eq!(config.poll_interval_ms, 250);
}

#[test]
fn test_cli_replay_format() {
    let cli = Cli::try_parse_from([
        "upf-monitor",
        "replay",
        "scenario.yaml",
        "--format",
        "json",
        "--config",
        "monitor.yaml",
    ])
    .unwrap();

    assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("monitor.yaml")));
    match cli.command {
        Some(Commands::Replay { file, format }) => {
            assert_eq!(file, std::path::PathBuf::from("scenario.yaml"));
            assert_eq!(format, OutputFormat::Json);
        }
        _ => panic!("expected replay"),
    }

    assert!(Cli::try_parse_from(["upf-monitor", "replay", "s.yaml", "--format", "xml"]).is_err());
}

#[test]
fn test_cli_zero_poll_interval_rejected() {
    let cli = Cli::try_parse_from(["upf-monitor", "run", "--poll-interval-ms", "0"]).unwrap();
    let mut config = MonitorConfig::default();
    let err = config
        .apply_overrides(&cli.command.unwrap().overrides())
        .unwrap_err();
    assert!(matches!(err, MonitorError::ConfigError(_)));
}

#[test]
fn test_config_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "toggles:\n  netfilter_tracing: true\nrings:\n  drop_bytes: 524288\nskb_layout:\n  len: 116"
    )
    .unwrap();

    let config = MonitorConfig::load_or_default(Some(file.path())).unwrap();
    assert!(config.toggles.netfilter_tracing);
    assert_eq!(config.rings.drop_bytes, 524288);
    assert_eq!(config.skb_layout().len, 116);
    assert_eq!(config.max_batch, MonitorConfig::default().max_batch);
}

#[tokio::test]
async fn test_handle_reasons_and_hooks() {
    use upf_monitor::cli::commands::handle_command;

    handle_command(Commands::Reasons, None).await.unwrap();
    handle_command(Commands::Hooks, None).await.unwrap();
}
