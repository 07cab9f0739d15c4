//! Active inbound transfers.
//!
//! For each download two threads run side by side: the blocking receiver
//! pipeline and the keep-alive pinger that holds the NAT pinhole toward
//! the producer open. Both stop when the progress handle is cancelled or
//! leaves the receiving state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;
use uuid::Uuid;

use pinhole_transfer::receiver::{
    run_keepalive, run_receiver, ReceiveProgress, ReceiverConfig, STATE_FAILED, STATE_RECEIVING,
};

pub struct ActiveDownload {
    pub transfer_id: Uuid,
    pub file_path: PathBuf,
    pub block_size: u64,
    pub total_blocks: u64,
    pub producer_addr: SocketAddr,
    pub progress: Arc<ReceiveProgress>,
}

#[derive(Default)]
pub struct DownloadService {
    downloads: RwLock<HashMap<Uuid, Arc<ActiveDownload>>>,
}

impl DownloadService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the receiver and keep-alive threads for one download.
    pub fn start_transfer(
        &self,
        transfer_id: Uuid,
        file_path: PathBuf,
        block_size: u64,
        total_blocks: u64,
        producer_addr: SocketAddr,
    ) -> anyhow::Result<Arc<ActiveDownload>> {
        let download = Arc::new(ActiveDownload {
            transfer_id,
            file_path: file_path.clone(),
            block_size,
            total_blocks,
            producer_addr,
            progress: Arc::new(ReceiveProgress::new()),
        });
        self.downloads.write().insert(transfer_id, download.clone());

        // Mark receiving before either thread starts so the pinger cannot
        // observe the idle state and quit immediately.
        download
            .progress
            .state
            .store(STATE_RECEIVING, Ordering::Relaxed);

        let pinger_progress = download.progress.clone();
        std::thread::Builder::new()
            .name(format!("keepalive-{transfer_id}"))
            .spawn(move || run_keepalive(producer_addr, transfer_id, pinger_progress))?;

        let config = ReceiverConfig {
            output_path: file_path,
            transfer_id,
            block_size,
            total_blocks,
            producer_addr,
            pre_bound_socket: None,
        };
        let progress = download.progress.clone();
        std::thread::Builder::new()
            .name(format!("receive-{transfer_id}"))
            .spawn(move || {
                if let Err(e) = run_receiver(config, progress.clone()) {
                    error!(%transfer_id, error = %e, "receive failed");
                    progress.state.store(STATE_FAILED, Ordering::Relaxed);
                }
            })?;

        Ok(download)
    }

    pub fn get(&self, transfer_id: Uuid) -> Option<Arc<ActiveDownload>> {
        self.downloads.read().get(&transfer_id).cloned()
    }

    /// Signal a download to stop. The receiver notices within its read
    /// deadline, the pinger within one interval.
    pub fn cancel(&self, transfer_id: Uuid) {
        if let Some(download) = self.get(transfer_id) {
            download.progress.cancelled.store(true, Ordering::Relaxed);
        }
    }
}
