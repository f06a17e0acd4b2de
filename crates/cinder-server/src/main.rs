//! cinder-server entry point.

mod config;
mod connection;
mod engine;
mod replication;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "cinder-server", version, about = "An in-memory key-value server")]
struct Args {
    /// Configuration file (directives, one per line).
    config: Option<PathBuf>,

    /// Override the listening port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the log level (debug, verbose, notice, warning).
    #[arg(long)]
    loglevel: Option<String>,

    /// Override the data directory.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.loglevel {
        config.loglevel = level;
    }
    if let Some(dir) = args.dir {
        config.dir = dir;
    }

    init_tracing(&config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        "cinder server starting"
    );

    server::run(config).await
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    // config loglevels use the historical names; map them onto
    // tracing's levels
    let level = match config.loglevel.as_str() {
        "debug" | "verbose" => "debug",
        "notice" => "info",
        "warning" => "warn",
        other => other,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cinder_server={level},cinder_core={level},cinder_persistence={level}"
        ))
    });

    match &config.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
