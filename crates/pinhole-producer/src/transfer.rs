//! Active outbound transfers.
//!
//! Each accepted transfer runs the blocking sender pipeline on its own
//! named thread; this service is the registry that tracks them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;
use uuid::Uuid;

use pinhole_peer::state::StateStore;
use pinhole_transfer::sender::{run_sender, SendProgress, SenderConfig, STATE_FAILED};

pub struct ActiveSend {
    pub transfer_id: Uuid,
    pub file_id: Uuid,
    pub file_path: PathBuf,
    pub block_size: u64,
    pub total_blocks: u64,
    pub consumer_addr: SocketAddr,
    pub progress: Arc<SendProgress>,
}

#[derive(Default)]
pub struct SendService {
    sends: RwLock<HashMap<Uuid, Arc<ActiveSend>>>,
}

impl SendService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the file and kick off the sender thread.
    pub fn start_transfer(
        &self,
        state: &StateStore,
        transfer_id: Uuid,
        file_id: Uuid,
        block_size: u64,
        total_blocks: u64,
        consumer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let entry = state
            .get_file(file_id)
            .ok_or_else(|| anyhow::anyhow!("file not found in state: {file_id}"))?;
        std::fs::metadata(&entry.file_path)
            .map_err(|e| anyhow::anyhow!("file does not exist: {e}"))?;

        let send = Arc::new(ActiveSend {
            transfer_id,
            file_id,
            file_path: entry.file_path.clone(),
            block_size,
            total_blocks,
            consumer_addr,
            progress: Arc::new(SendProgress::new()),
        });
        self.sends.write().insert(transfer_id, send.clone());

        let config = SenderConfig {
            file_path: send.file_path.clone(),
            target_addr: consumer_addr,
            transfer_id,
            block_size,
            total_blocks,
            pre_bound_socket: None,
        };
        let progress = send.progress.clone();
        std::thread::Builder::new()
            .name(format!("send-{transfer_id}"))
            .spawn(move || {
                if let Err(e) = run_sender(config, progress.clone()) {
                    error!(%transfer_id, error = %e, "send failed");
                    progress.state.store(STATE_FAILED, Ordering::Relaxed);
                }
            })?;
        Ok(())
    }

    pub fn get(&self, transfer_id: Uuid) -> Option<Arc<ActiveSend>> {
        self.sends.read().get(&transfer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhole_peer::state::StateStore;

    #[test]
    fn start_transfer_requires_known_file() {
        let state = StateStore::empty("/tmp/does-not-matter.json");
        let service = SendService::new();
        let err = service
            .start_transfer(
                &state,
                Uuid::new_v4(),
                Uuid::new_v4(),
                1024,
                1,
                "127.0.0.1:9".parse().unwrap(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("file not found in state"));
    }
}
