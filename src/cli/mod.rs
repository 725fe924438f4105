pub mod commands;

use crate::config::Overrides;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "upf-monitor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "eBPF traffic and drop observer for gtp5g user plane functions", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to a YAML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Load and attach the probes, then report until Ctrl-C")]
    Run {
        #[arg(long, help = "Emit a trace event for every observed packet")]
        detailed_tracing: bool,

        #[arg(long, help = "Report unexplained frees from the kfree_skb tracepoint")]
        drop_tracing: bool,

        #[arg(long, help = "Watch ip_forward and netfilter verdicts")]
        netfilter_tracing: bool,

        #[arg(long, help = "Ring poll interval in milliseconds")]
        poll_interval_ms: Option<u64>,
    },
    #[command(about = "List the kernel hook points")]
    Hooks,
    #[command(about = "List the drop reason codes")]
    Reasons,
    #[command(about = "Replay a YAML scenario through the host datapath model")]
    Replay {
        #[arg(help = "Scenario file")]
        file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, help = "Output format")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Commands {
    /// Flag values of `run` as config overrides. Empty for other commands.
    pub fn overrides(&self) -> Overrides {
        match self {
            Commands::Run {
                detailed_tracing,
                drop_tracing,
                netfilter_tracing,
                poll_interval_ms,
            } => Overrides {
                detailed_tracing: *detailed_tracing,
                drop_tracing: *drop_tracing,
                netfilter_tracing: *netfilter_tracing,
                poll_interval_ms: *poll_interval_ms,
            },
            _ => Overrides::default(),
        }
    }
}
