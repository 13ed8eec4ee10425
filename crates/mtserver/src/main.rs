//! mtserver - share mountaintools collections over HTTP.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mtconfig::MountainConfig;
use mtserver::ServerState;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mtserver")]
#[command(about = "Share mountaintools collections over HTTP")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the usual search path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the collections [default: <cache_dir>/share]
    #[arg(long)]
    root: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = MountainConfig::load_from(cli.config.as_deref()).context("failed to load config")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.infra.telemetry.log_level)),
        )
        .init();

    let server = &config.infra.server;
    let root = cli
        .root
        .unwrap_or_else(|| config.infra.paths.cache_dir.join("share"));
    let host = cli.host.unwrap_or_else(|| server.host.clone());
    let port = cli.port.unwrap_or(server.port);

    if server.write_token.is_none() {
        warn!("no write token configured; serving readonly");
    }
    let state = ServerState::new(root)
        .with_tokens(server.read_token.clone(), server.write_token.clone());

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    mtserver::serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = terminate() => {
            info!("received SIGTERM, shutting down");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
