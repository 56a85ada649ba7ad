use anyhow::Context;
use clap::Parser;
use netinsight::cli::{commands, Cli};
use std::process;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    info!("Starting netinsight v{}", netinsight::VERSION);

    let Some(command) = cli.command else {
        eprintln!("No command specified. Use --help for usage information.");
        process::exit(1);
    };

    commands::handle_command(command, cli.config.as_deref())
        .await
        .context("netinsight failed")?;

    Ok(())
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}
