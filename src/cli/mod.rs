pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netinsight")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Kubernetes-aware network flow metrics from eBPF counters", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Configuration file (YAML)")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Attach to an interface and export flow metrics until interrupted")]
    Run {
        #[arg(long, value_parser = parse_duration, help = "Polling interval (e.g. 10s)")]
        interval: Option<Duration>,

        #[arg(short, long, help = "Network interface to attach to")]
        interface: Option<String>,

        #[arg(long, help = "Metrics listen address (e.g. 0.0.0.0:8080)")]
        listen: Option<SocketAddr>,

        #[arg(long, help = "Do not serve Prometheus metrics")]
        no_metrics: bool,

        #[arg(long, help = "Print a summary table for every interval")]
        console: bool,
    },
    #[command(about = "Take one aggregated snapshot and print it")]
    Snapshot {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        #[arg(long, value_parser = parse_duration, default_value = "5s", help = "Time to count before reading")]
        wait: Duration,

        #[arg(short, long, help = "Network interface to attach to")]
        interface: Option<String>,
    },
    #[command(about = "Validate the configuration and print it with defaults filled in")]
    CheckConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "netinsight",
            "-v",
            "run",
            "--interval",
            "15s",
            "--interface",
            "ens5",
            "--no-metrics",
        ]);

        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Run {
                interval,
                interface,
                no_metrics,
                ..
            }) => {
                assert_eq!(interval, Some(Duration::from_secs(15)));
                assert_eq!(interface.as_deref(), Some("ens5"));
                assert!(no_metrics);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_snapshot_defaults() {
        let cli = Cli::parse_from(["netinsight", "snapshot", "--format", "yaml"]);
        match cli.command {
            Some(Commands::Snapshot { format, wait, .. }) => {
                assert_eq!(format, OutputFormat::Yaml);
                assert_eq!(wait, Duration::from_secs(5));
            }
            _ => panic!("expected snapshot command"),
        }
    }

    #[test]
    fn test_invalid_duration_rejected() {
        assert!(Cli::try_parse_from(["netinsight", "run", "--interval", "soon"]).is_err());
    }
}
