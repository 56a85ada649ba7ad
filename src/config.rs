//! Configuration loaded from an optional YAML file
//!
//! Every field has a default, so an empty file (or none at all) is a valid
//! configuration. Durations use humantime syntax (`10s`, `5m`).

use crate::{NetInsightError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Time between counter polls
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Aggregations allowed to run at once before ticks are skipped
    pub max_in_flight_polls: usize,
    /// Intervals queued for sinks before new ones are dropped
    pub sink_buffer: usize,
    /// Print a table for every interval
    pub console_summary: bool,
    pub resolver: ResolverConfig,
    pub source: SourceConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    #[serde(with = "humantime_serde")]
    pub positive_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub negative_ttl: Duration,
    /// Limit on each directory query
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Lookups running at once per interval
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Compiled XDP object
    pub object_path: PathBuf,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_in_flight_polls: 2,
            sink_buffer: 4,
            console_summary: false,
            resolver: ResolverConfig::default(),
            source: SourceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            positive_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            query_timeout: Duration::from_secs(2),
            concurrency: 16,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from("ebpf/monitor.o"),
            interface: "eth0".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Config {
    /// Read `path` if given, otherwise start from defaults. The result is
    /// validated either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    NetInsightError::ConfigError(format!("{}: {}", path.display(), e))
                })?;
                Self::from_yaml(&contents)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| NetInsightError::ConfigError(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| NetInsightError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(NetInsightError::ConfigError(
                "interval must be greater than 0".to_string(),
            ));
        }

        if self.max_in_flight_polls == 0 {
            return Err(NetInsightError::ConfigError(
                "max_in_flight_polls must be greater than 0".to_string(),
            ));
        }

        if self.sink_buffer == 0 {
            return Err(NetInsightError::ConfigError(
                "sink_buffer must be greater than 0".to_string(),
            ));
        }

        let resolver = &self.resolver;
        if resolver.query_timeout.is_zero() {
            return Err(NetInsightError::ConfigError(
                "resolver.query_timeout must be greater than 0".to_string(),
            ));
        }

        if resolver.concurrency == 0 {
            return Err(NetInsightError::ConfigError(
                "resolver.concurrency must be greater than 0".to_string(),
            ));
        }

        if resolver.negative_ttl > resolver.positive_ttl {
            return Err(NetInsightError::ConfigError(format!(
                "resolver.negative_ttl ({:?}) must not exceed resolver.positive_ttl ({:?})",
                resolver.negative_ttl, resolver.positive_ttl
            )));
        }

        if self.source.interface.is_empty() {
            return Err(NetInsightError::ConfigError(
                "source.interface must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
