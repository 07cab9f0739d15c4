mod config;
mod registry;
mod routes;
mod transfers;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{LogConfig, SignallerConfig};
use crate::registry::{FileRegistry, ProducerRegistry};
use crate::routes::AppState;
use crate::transfers::TransferCoordinator;
use crate::ws::WsMultiplexer;

/// How long open connections get to finish after a shutdown signal.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "pinhole-signaller", about = "Rendezvous server for pinhole transfers")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SignallerConfig::load(args.config.as_deref())?;
    init_tracing(&config.log);

    let producers = Arc::new(ProducerRegistry::new());
    let files = Arc::new(FileRegistry::new(producers.clone()));
    let ws = Arc::new(WsMultiplexer::new(producers.clone()));
    let transfers = Arc::new(TransferCoordinator::new(
        files.clone(),
        producers.clone(),
        ws.clone(),
    ));

    let state = AppState {
        producers,
        files,
        transfers,
        ws,
    };
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("signaller listening on {addr}");

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let drain = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { drain.notified().await })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    shutdown.notify_one();

    match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, server).await {
        Ok(result) => result??,
        Err(_) => warn!("drain timeout exceeded, aborting open connections"),
    }
    info!("signaller stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log.level));

    match &log.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path);
            match file {
                Ok(file) => tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .init(),
                Err(e) => {
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                    warn!(path = %path.display(), error = %e, "cannot open log file, using stderr");
                }
            }
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received ctrl-c");
    }
}
