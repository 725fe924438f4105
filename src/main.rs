use anyhow::Context;
use clap::Parser;
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upf_monitor::cli::{commands, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = cli.command else {
        eprintln!("No command specified. Use --help for usage information.");
        process::exit(1);
    };

    info!("Starting upf-monitor v{}", upf_monitor::VERSION);

    let config_path = cli.config.as_deref();
    commands::handle_command(command, config_path)
        .await
        .with_context(|| match config_path {
            Some(path) => format!("using config {}", path.display()),
            None => "using default config".to_string(),
        })
}
