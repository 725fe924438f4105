pub mod cli;
pub mod config;
pub mod control;
pub mod datapath;
pub mod ebpf;
pub mod error;
pub mod metrics;

pub use error::{MonitorError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
