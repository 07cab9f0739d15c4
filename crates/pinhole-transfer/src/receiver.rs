//! Consumer-side receive loop, keep-alive pinger, and ordered file writer.
//!
//! The receiver binds an ephemeral socket and vacuums data packets into a
//! serial-indexed map until every block has arrived or it is cancelled.
//! Completion is judged from the map's length alone, so duplicate serials
//! can never inflate the count. The keep-alive pinger runs beside it,
//! poking the producer once a second to keep the NAT pinhole open.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::packet::{UdpPacket, CONTENT_TYPE_DATA, MAX_DATAGRAM_SIZE};

pub const STATE_IDLE: u8 = 0;
pub const STATE_RECEIVING: u8 = 1;
pub const STATE_COMPLETE: u8 = 2;
pub const STATE_FAILED: u8 = 3;

/// Read deadline per receive iteration; the loop wakes this often to check
/// cancellation even when no packets arrive.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Keep-alive cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Shared progress/cancellation handle for one inbound transfer.
pub struct ReceiveProgress {
    pub blocks_received: AtomicU64,
    /// Blocks never received, counted during the write pass. Non-zero
    /// means the output has zero-filled holes and the transfer failed.
    pub missing_blocks: AtomicU64,
    pub state: AtomicU8,
    pub cancelled: AtomicBool,
}

impl ReceiveProgress {
    pub fn new() -> Self {
        Self {
            blocks_received: AtomicU64::new(0),
            missing_blocks: AtomicU64::new(0),
            state: AtomicU8::new(STATE_IDLE),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl Default for ReceiveProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReceiverConfig {
    pub output_path: PathBuf,
    pub transfer_id: Uuid,
    pub block_size: u64,
    pub total_blocks: u64,
    /// Only datagrams from exactly this address are accepted.
    pub producer_addr: SocketAddr,
    /// Socket to listen on. When absent, binds 0.0.0.0:0.
    pub pre_bound_socket: Option<UdpSocket>,
}

/// Run the receive loop and write the reassembled file. Blocks the calling
/// thread until all blocks arrive or the transfer is cancelled.
pub fn run_receiver(mut config: ReceiverConfig, progress: Arc<ReceiveProgress>) -> Result<(), String> {
    let socket = match config.pre_bound_socket.take() {
        Some(s) => s,
        None => UdpSocket::bind("0.0.0.0:0").map_err(|e| format!("udp bind: {e}"))?,
    };
    socket
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|e| format!("set read timeout: {e}"))?;

    progress.state.store(STATE_RECEIVING, Ordering::Relaxed);
    let transfer_start = SystemTime::now();
    let mut blocks: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    info!(
        transfer_id = %config.transfer_id,
        producer = %config.producer_addr,
        total_blocks = config.total_blocks,
        listening = %socket.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into()),
        "starting block receive"
    );

    while (blocks.len() as u64) < config.total_blocks {
        if progress.is_cancelled() {
            progress.state.store(STATE_FAILED, Ordering::Relaxed);
            return Err("cancelled".into());
        }

        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "udp recv error");
                continue;
            }
        };

        if src != config.producer_addr {
            debug!(%src, "dropping datagram from unexpected source");
            continue;
        }

        let packet = match UdpPacket::unmarshal(&buf[..n], transfer_start) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, len = n, "dropping malformed datagram");
                continue;
            }
        };

        if packet.transfer_id != config.transfer_id {
            continue;
        }
        if packet.content_type != CONTENT_TYPE_DATA {
            continue;
        }

        blocks.insert(packet.serial_number, packet.data);
        let received = blocks.len() as u64;
        progress.blocks_received.store(received, Ordering::Relaxed);
        if received % 100 == 0 || received == config.total_blocks {
            debug!(received, total = config.total_blocks, "received block");
        }
    }

    let missing = write_blocks(&config, &blocks)?;
    progress.missing_blocks.store(missing, Ordering::Relaxed);

    if missing > 0 {
        warn!(
            transfer_id = %config.transfer_id,
            missing,
            "transfer finished with zero-filled holes"
        );
        progress.state.store(STATE_FAILED, Ordering::Relaxed);
    } else {
        progress.state.store(STATE_COMPLETE, Ordering::Relaxed);
        info!(transfer_id = %config.transfer_id, path = %config.output_path.display(), "download complete");
    }
    Ok(())
}

/// Write blocks `[0, total_blocks)` in serial order. Holes are zero-filled
/// and counted; the caller decides what a non-zero count means.
fn write_blocks(config: &ReceiverConfig, blocks: &HashMap<u64, Vec<u8>>) -> Result<u64, String> {
    if let Some(parent) = config.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create output dir: {e}"))?;
        }
    }
    let mut file = File::create(&config.output_path)
        .map_err(|e| format!("cannot create {}: {e}", config.output_path.display()))?;

    let zeros = vec![0u8; config.block_size as usize];
    let mut missing = 0u64;
    for serial in 0..config.total_blocks {
        match blocks.get(&serial) {
            Some(data) => file
                .write_all(data)
                .map_err(|e| format!("write block {serial}: {e}"))?,
            None => {
                warn!(serial, "missing block, writing zeros");
                file.write_all(&zeros)
                    .map_err(|e| format!("write block {serial}: {e}"))?;
                missing += 1;
            }
        }
    }
    Ok(missing)
}

/// Ping the producer once a second until the transfer leaves the receiving
/// state. Each ping uses a short-lived socket; the point is the outbound
/// datagram itself, which re-opens the consumer's NAT mapping toward the
/// producer.
pub fn run_keepalive(producer_addr: SocketAddr, transfer_id: Uuid, progress: Arc<ReceiveProgress>) {
    let ping_start = SystemTime::now();
    loop {
        thread::sleep(KEEPALIVE_INTERVAL);
        if progress.is_cancelled()
            || progress.state.load(Ordering::Relaxed) != STATE_RECEIVING
        {
            return;
        }
        if let Err(e) = send_ping(producer_addr, transfer_id, ping_start) {
            warn!(error = %e, "keep-alive ping failed");
        }
    }
}

fn send_ping(addr: SocketAddr, transfer_id: Uuid, start: SystemTime) -> Result<(), String> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| format!("bind: {e}"))?;
    socket.connect(addr).map_err(|e| format!("connect: {e}"))?;
    let wire = UdpPacket::keepalive(transfer_id)
        .marshal(start)
        .map_err(|e| format!("marshal: {e}"))?;
    socket.send(&wire).map_err(|e| format!("send: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_blocks_counts_and_fills_holes() {
        let dir = std::env::temp_dir().join(format!("pinhole-recv-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("holes.bin");

        let config = ReceiverConfig {
            output_path: out.clone(),
            transfer_id: Uuid::new_v4(),
            block_size: 4,
            total_blocks: 3,
            producer_addr: "127.0.0.1:1".parse().unwrap(),
            pre_bound_socket: None,
        };

        let mut blocks = HashMap::new();
        blocks.insert(0, vec![1u8; 4]);
        blocks.insert(2, vec![3u8; 4]);

        let missing = write_blocks(&config, &blocks).unwrap();
        assert_eq!(missing, 1);
        let written = std::fs::read(&out).unwrap();
        assert_eq!(written, [vec![1u8; 4], vec![0u8; 4], vec![3u8; 4]].concat());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
