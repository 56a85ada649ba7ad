pub mod cli;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod pipeline;
pub mod ui;

pub use error::{NetInsightError, Result};
pub use pipeline::{Pipeline, PipelineReport, PipelineSettings, PipelineState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
