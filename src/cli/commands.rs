use crate::cli::{Commands, OutputFormat};
use crate::config::Config;
use crate::k8s::{ClusterDirectory, IdentityResolver, K8sClient, StaticDirectory};
use crate::metrics::{MetricsServer, MetricsSink, PrometheusSink};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::ui::ConsoleSink;
use crate::{NetInsightError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(target_os = "linux")]
use crate::ebpf::KernelCounterSource;
#[cfg(not(target_os = "linux"))]
use crate::ebpf::ReplayCounterSource;

pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> Result<()> {
    let mut config = Config::load(config_path)?;

    match command {
        Commands::Run {
            interval,
            interface,
            listen,
            no_metrics,
            console,
        } => {
            if let Some(interval) = interval {
                config.interval = interval;
            }
            if let Some(interface) = interface {
                config.source.interface = interface;
            }
            if let Some(listen) = listen {
                config.metrics.listen_addr = listen;
            }
            if no_metrics {
                config.metrics.enabled = false;
            }
            if console {
                config.console_summary = true;
            }
            config.validate()?;
            handle_run(config).await
        }
        Commands::Snapshot {
            format,
            wait,
            interface,
        } => {
            if let Some(interface) = interface {
                config.source.interface = interface;
            }
            config.validate()?;
            handle_snapshot(config, format, wait).await
        }
        Commands::CheckConfig => handle_check_config(&config),
    }
}

async fn handle_run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    let source = attach_source(&config).await?;
    let resolver = IdentityResolver::new(
        connect_directory().await,
        config.resolver.clone(),
        cancel.child_token(),
    );

    let mut sinks: Vec<Arc<dyn MetricsSink>> = Vec::new();
    let mut server = None;

    if config.metrics.enabled {
        let sink = Arc::new(PrometheusSink::new()?);
        server = Some(
            MetricsServer::start(
                config.metrics.listen_addr,
                sink.registry().clone(),
                cancel.clone(),
            )
            .await?,
        );
        sinks.push(sink);
    }
    if config.console_summary {
        sinks.push(Arc::new(ConsoleSink::new()));
    }

    let pipeline = Pipeline::new(
        source.clone(),
        resolver,
        sinks,
        PipelineSettings::from(&config),
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Cannot listen for shutdown signal"),
        }
    });

    info!("netinsight running. Press Ctrl+C to exit.");
    let report = pipeline.run(config.interval, cancel.clone()).await;

    cancel.cancel();
    detach_source(&source).await;
    if let Some(server) = server {
        server.join().await;
    }

    info!(
        published = report.published,
        skipped = report.skipped_unavailable + report.skipped_busy,
        dropped = report.dropped,
        "netinsight stopped"
    );
    Ok(())
}

async fn handle_snapshot(config: Config, format: OutputFormat, wait: Duration) -> Result<()> {
    let cancel = CancellationToken::new();

    let source = attach_source(&config).await?;
    let resolver = IdentityResolver::new(
        connect_directory().await,
        config.resolver.clone(),
        cancel.child_token(),
    );
    let pipeline = Pipeline::new(
        source.clone(),
        resolver,
        Vec::new(),
        PipelineSettings::from(&config),
    );

    info!("Counting for {:?}", wait);
    tokio::time::sleep(wait).await;

    let interval = pipeline.poll_once().await;
    detach_source(&source).await;
    let interval = interval?;

    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&interval)?,
        OutputFormat::Yaml => serde_yaml::to_string(&interval)
            .map_err(|e| NetInsightError::Serialization(e.to_string()))?,
    };
    println!("{}", rendered);
    Ok(())
}

fn handle_check_config(config: &Config) -> Result<()> {
    println!("{}", config.to_yaml()?);
    info!("Configuration is valid");
    Ok(())
}

/// Kubernetes when reachable, otherwise an empty directory
async fn connect_directory() -> Arc<dyn ClusterDirectory> {
    match K8sClient::try_default().await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!(error = %e, "Kubernetes unavailable, addresses will stay unresolved");
            Arc::new(StaticDirectory::new())
        }
    }
}

#[cfg(target_os = "linux")]
async fn attach_source(config: &Config) -> Result<Arc<KernelCounterSource>> {
    let source = Arc::new(KernelCounterSource::new(config.source.clone()));
    source.attach().await?;
    Ok(source)
}

#[cfg(target_os = "linux")]
async fn detach_source(source: &KernelCounterSource) {
    source.detach().await;
}

#[cfg(not(target_os = "linux"))]
async fn attach_source(_config: &Config) -> Result<Arc<ReplayCounterSource>> {
    Err(NetInsightError::UnsupportedFeature(
        "kernel counters require Linux".to_string(),
    ))
}

#[cfg(not(target_os = "linux"))]
async fn detach_source(_source: &ReplayCounterSource) {}
