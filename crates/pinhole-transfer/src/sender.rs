//! Producer-side block sender.
//!
//! Reads the file sequentially in `block_size` chunks and fires each one
//! at the consumer as a numbered data packet. Best-effort: a failed send
//! or marshal skips that block and moves on — there is no retransmission
//! channel in this protocol version.

use std::fs::File;
use std::io::{self, Read};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::packet::UdpPacket;

pub const STATE_IDLE: u8 = 0;
pub const STATE_SENDING: u8 = 1;
pub const STATE_COMPLETE: u8 = 2;
pub const STATE_FAILED: u8 = 3;

/// Shared progress/cancellation handle for one outbound transfer.
pub struct SendProgress {
    pub blocks_sent: AtomicU64,
    pub state: AtomicU8,
    pub cancelled: AtomicBool,
}

impl SendProgress {
    pub fn new() -> Self {
        Self {
            blocks_sent: AtomicU64::new(0),
            state: AtomicU8::new(STATE_IDLE),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl Default for SendProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SenderConfig {
    pub file_path: PathBuf,
    pub target_addr: SocketAddr,
    pub transfer_id: Uuid,
    pub block_size: u64,
    pub total_blocks: u64,
    /// Socket to send from. When absent an ephemeral one is bound; tests
    /// pass a pre-bound socket so the receiver knows the source address.
    pub pre_bound_socket: Option<UdpSocket>,
}

/// Run the send loop to completion. Blocks the calling thread; cancellation
/// is honoured between blocks, not within a single send.
pub fn run_sender(config: SenderConfig, progress: Arc<SendProgress>) -> Result<(), String> {
    let mut file = File::open(&config.file_path)
        .map_err(|e| format!("cannot open {}: {e}", config.file_path.display()))?;

    let socket = match config.pre_bound_socket {
        Some(s) => s,
        None => create_send_socket().map_err(|e| format!("udp socket: {e}"))?,
    };
    socket
        .connect(config.target_addr)
        .map_err(|e| format!("udp connect {}: {e}", config.target_addr))?;

    progress.state.store(STATE_SENDING, Ordering::Relaxed);
    let transfer_start = SystemTime::now();
    let mut buffer = vec![0u8; config.block_size as usize];

    info!(
        transfer_id = %config.transfer_id,
        target = %config.target_addr,
        total_blocks = config.total_blocks,
        block_size = config.block_size,
        "starting block send"
    );

    for serial in 0..config.total_blocks {
        if progress.is_cancelled() {
            progress.state.store(STATE_FAILED, Ordering::Relaxed);
            return Err("cancelled".into());
        }

        let n = read_block(&mut file, &mut buffer)
            .map_err(|e| format!("read error at block {serial}: {e}"))?;
        if n == 0 {
            break; // EOF before the computed block count; size shrank underneath us
        }

        let packet = UdpPacket::data(serial, config.transfer_id, buffer[..n].to_vec());
        match packet.marshal(transfer_start) {
            Ok(wire) => {
                if let Err(e) = socket.send(&wire) {
                    warn!(serial, error = %e, "send failed, skipping block");
                    continue;
                }
            }
            Err(e) => {
                warn!(serial, error = %e, "marshal failed, skipping block");
                continue;
            }
        }

        progress.blocks_sent.fetch_add(1, Ordering::Relaxed);
        if serial % 100 == 0 || serial + 1 == config.total_blocks {
            debug!(serial, total = config.total_blocks, "sent block");
        }
    }

    progress.state.store(STATE_COMPLETE, Ordering::Relaxed);
    info!(transfer_id = %config.transfer_id, "block send complete");
    Ok(())
}

/// Fill `buf` from the reader, tolerating short reads. Returns the number
/// of bytes read; 0 means EOF.
fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn create_send_socket() -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.bind(&"0.0.0.0:0".parse::<SocketAddr>().unwrap().into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_block_handles_short_final_block() {
        let dir = std::env::temp_dir().join(format!("pinhole-sender-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("short.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[7u8; 10]).unwrap();
        drop(f);

        let mut file = File::open(&path).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read_block(&mut file, &mut buf).unwrap(), 8);
        assert_eq!(read_block(&mut file, &mut buf).unwrap(), 2);
        assert_eq!(read_block(&mut file, &mut buf).unwrap(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
