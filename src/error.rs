use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetInsightError {
    #[error("Counter source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Failed to read counter table {table}: {reason}")]
    TableRead { table: String, reason: String },

    #[error("Failed to load eBPF program: {0}")]
    ProgramLoadFailed(String),

    #[error("Failed to attach eBPF program: {0}")]
    AttachFailed(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Directory query for {address} timed out after {timeout_ms}ms")]
    ResolutionTimeout { address: String, timeout_ms: u64 },

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Kernel version {version} is too old. Minimum required: {min_version}")]
    KernelVersionTooOld {
        version: String,
        min_version: String,
    },

    #[error("Unsupported feature on this system: {0}")]
    UnsupportedFeature(String),
}

impl From<prometheus::Error> for NetInsightError {
    fn from(e: prometheus::Error) -> Self {
        NetInsightError::MetricsError(e.to_string())
    }
}

impl From<kube::Error> for NetInsightError {
    fn from(e: kube::Error) -> Self {
        NetInsightError::KubernetesError(e.to_string())
    }
}

impl From<serde_json::Error> for NetInsightError {
    fn from(e: serde_json::Error) -> Self {
        NetInsightError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetInsightError>;
