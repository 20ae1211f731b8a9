//! switchyard daemon: loads the config, starts the engine loops and the HTTP
//! server, and runs until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sy_core::config::Config;
use sy_daemon::Daemon;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// switchyard daemon -- route tasks to workers and run workflows.
#[derive(Parser)]
#[command(name = "sy-daemon", version, about)]
struct Cli {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `daemon.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Do not serve HTTP.
    #[arg(long)]
    no_http: bool,

    /// Print the effective config as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path.clone())
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.daemon.port = port;
    }
    if cli.no_http {
        config.daemon.http_enabled = false;
    }

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    sy_telemetry::logging::init_from_config("sy-daemon", &config.general);
    info!(version = env!("CARGO_PKG_VERSION"), "switchyard daemon starting");

    let mut daemon = Daemon::new(config)?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
