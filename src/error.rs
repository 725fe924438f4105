use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("eBPF error: {0}")]
    EbpfError(String),

    #[error("Failed to load eBPF program {program}: {reason}")]
    ProgramLoadFailed { program: String, reason: String },

    #[error("Failed to attach {program} to {target}: {reason}")]
    AttachFailed {
        program: String,
        target: String,
        reason: String,
    },

    #[error("Kernel symbol {0} not found in /proc/kallsyms (is the gtp5g module loaded?)")]
    SymbolNotFound(String),

    #[error("Map {0} not found in eBPF object")]
    MapNotFound(String),

    #[error("Map {map} access failed: {reason}")]
    MapError { map: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Kernel version {version} is too old. Minimum required: {min_version}")]
    KernelVersionTooOld {
        version: String,
        min_version: String,
    },

    #[error("eBPF probes were not built into this binary (bpf-linker missing at build time)")]
    ProbesNotBuilt,

    #[error("Malformed {kind} record: {reason}")]
    MalformedEvent { kind: &'static str, reason: String },

    #[error("Unsupported feature on this system: {0}")]
    UnsupportedFeature(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
