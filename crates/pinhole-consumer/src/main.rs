mod transfer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use pinhole_peer::client::SignallerClient;
use pinhole_peer::config::PeerConfig;
use pinhole_peer::resolve_endpoint;
use pinhole_peer::stun::StunClient;
use pinhole_transfer::receiver::{STATE_COMPLETE, STATE_FAILED};
use pinhole_types::models::UdpOptions;

use crate::transfer::DownloadService;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "pinhole-consumer", about = "Download files from pinhole producers")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a file by id.
    Download {
        #[arg(long)]
        file_id: Uuid,
        /// Output path; defaults to the file id in the current directory.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PeerConfig::load(args.config.as_deref())?;
    pinhole_peer::init_tracing(&config.log.level);

    match args.command {
        Command::Download { file_id, output } => download(&config, file_id, output).await,
    }
}

async fn download(
    config: &PeerConfig,
    file_id: Uuid,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let external = detect_external_endpoint(config).await?;

    let client = SignallerClient::new(&config.signaller.url);
    info!(%file_id, "initiating download");
    let result = client
        .init_download(
            file_id,
            UdpOptions {
                external_ip: external.ip().to_string(),
                external_port: external.port(),
            },
        )
        .await
        .context("failed to init download")?;

    println!("transfer id:  {}", result.transfer_id);
    println!(
        "producer:     {}:{}",
        result.producer_udp_options.external_ip, result.producer_udp_options.external_port
    );
    println!("block size:   {} bytes", result.block_size);
    println!("total blocks: {}", result.total_blocks);

    let output = output.unwrap_or_else(|| PathBuf::from(file_id.to_string()));
    let producer_addr =
        resolve_endpoint(&result.producer_udp_options).context("bad producer address")?;

    let downloads = DownloadService::new();
    let download = downloads.start_transfer(
        result.transfer_id,
        output.clone(),
        result.block_size,
        result.total_blocks,
        producer_addr,
    )?;

    println!("waiting for transfer to complete, ctrl-c cancels");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                downloads.cancel(result.transfer_id);
                anyhow::bail!("download cancelled");
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                match download.progress.state.load(Ordering::Relaxed) {
                    STATE_COMPLETE => {
                        println!("download complete: {}", output.display());
                        return Ok(());
                    }
                    STATE_FAILED => {
                        let missing = download.progress.missing_blocks.load(Ordering::Relaxed);
                        if missing > 0 {
                            anyhow::bail!("download failed: {missing} blocks never arrived");
                        }
                        anyhow::bail!("download failed");
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn detect_external_endpoint(config: &PeerConfig) -> anyhow::Result<SocketAddr> {
    info!("detecting external address via stun");
    let stun = StunClient::new(
        config.stun.servers.clone(),
        config.stun.local_port,
        config.stun.timeout(),
    );
    let addr = tokio::task::spawn_blocking(move || stun.query()).await??;
    info!("external address: {addr}");
    Ok(addr)
}
