mod listener;
mod transfer;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use pinhole_peer::client::SignallerClient;
use pinhole_peer::config::PeerConfig;
use pinhole_peer::state::{StateStore, DEFAULT_STATE_FILE};
use pinhole_peer::stun::StunClient;
use pinhole_types::models::UdpOptions;

#[derive(Parser)]
#[command(name = "pinhole-producer", about = "Serve files to pinhole consumers")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register this producer with the signaller and persist its id.
    Register {
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,
    },
    /// Register a file so consumers can download it.
    RegisterFile {
        /// Path to the file to serve.
        #[arg(long)]
        path: PathBuf,
        /// Producer id; defaults to the one saved in the state file.
        #[arg(long)]
        producer_id: Option<Uuid>,
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,
    },
    /// Connect to the signaller and serve transfer requests.
    Listen {
        /// Producer id; defaults to the one saved in the state file.
        #[arg(long)]
        producer_id: Option<Uuid>,
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PeerConfig::load(args.config.as_deref())?;
    pinhole_peer::init_tracing(&config.log.level);

    match args.command {
        Command::Register { state_file } => register(&config, &state_file).await,
        Command::RegisterFile {
            path,
            producer_id,
            state_file,
        } => register_file(&config, &path, producer_id, &state_file).await,
        Command::Listen {
            producer_id,
            state_file,
        } => listen(&config, producer_id, &state_file).await,
    }
}

async fn register(config: &PeerConfig, state_file: &Path) -> anyhow::Result<()> {
    let mut state = open_state(state_file);
    let external = detect_external_endpoint(config).await?;

    let client = SignallerClient::new(&config.signaller.url);
    let producer_id = client
        .register_producer(UdpOptions {
            external_ip: external.ip().to_string(),
            external_port: external.port(),
        })
        .await
        .context("failed to register producer")?;

    state.set_producer_id(producer_id)?;
    println!("producer registered: {producer_id}");
    println!("state saved to {}", state.path().display());
    Ok(())
}

async fn register_file(
    config: &PeerConfig,
    path: &Path,
    producer_id: Option<Uuid>,
    state_file: &Path,
) -> anyhow::Result<()> {
    let absolute = std::fs::canonicalize(path)
        .with_context(|| format!("file does not exist: {}", path.display()))?;
    let metadata = std::fs::metadata(&absolute)?;
    if metadata.is_dir() {
        anyhow::bail!("path is a directory, not a file: {}", absolute.display());
    }
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("path has no file name")?;
    let size = metadata.len();

    let hash_path = absolute.clone();
    let hash = tokio::task::spawn_blocking(move || sha256_file(&hash_path)).await??;

    let mut state = open_state(state_file);
    let producer_id = resolve_producer_id(producer_id, &state)?;

    let client = SignallerClient::new(&config.signaller.url);
    let file_id = client
        .register_file(name.clone(), size, Some(hash), producer_id)
        .await
        .context("failed to register file")?;

    state.add_file(file_id, name, size, absolute.clone())?;
    println!("file registered: {file_id}");
    println!("serving from: {}", absolute.display());
    println!("state saved to {}", state.path().display());
    Ok(())
}

async fn listen(
    config: &PeerConfig,
    producer_id: Option<Uuid>,
    state_file: &Path,
) -> anyhow::Result<()> {
    let state = open_state(state_file);
    let producer_id = resolve_producer_id(producer_id, &state)?;
    info!(%producer_id, files = state.files().len(), "starting listener");
    listener::run(config, producer_id, state).await
}

fn open_state(path: &Path) -> StateStore {
    match StateStore::open(path) {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "failed to load state, starting empty");
            StateStore::empty(path)
        }
    }
}

fn resolve_producer_id(explicit: Option<Uuid>, state: &StateStore) -> anyhow::Result<Uuid> {
    if let Some(id) = explicit {
        return Ok(id);
    }
    match state.producer_id() {
        Some(id) => {
            info!("using saved producer id {id}");
            Ok(id)
        }
        None => anyhow::bail!(
            "producer id not found; pass --producer-id or run `register` first"
        ),
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

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
