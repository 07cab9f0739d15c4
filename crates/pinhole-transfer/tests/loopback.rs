//! End-to-end sender → receiver over localhost UDP.

use std::fs;
use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use uuid::Uuid;

use pinhole_transfer::receiver::{
    run_receiver, ReceiveProgress, ReceiverConfig, STATE_COMPLETE,
};
use pinhole_transfer::sender::{run_sender, SendProgress, SenderConfig};

const BLOCK_SIZE: u64 = 1024;

#[test]
fn loopback_transfer_reassembles_the_file() {
    let dir = std::env::temp_dir().join(format!("pinhole-loopback-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    // 4 full blocks plus a 37-byte tail.
    let payload: Vec<u8> = (0..(4 * BLOCK_SIZE + 37)).map(|i| (i % 251) as u8).collect();
    let source = dir.join("source.bin");
    let output = dir.join("output.bin");
    fs::write(&source, &payload).unwrap();

    let total_blocks = (payload.len() as u64).div_ceil(BLOCK_SIZE);
    let transfer_id = Uuid::new_v4();

    // Pre-bind both sockets so each side knows the other's real address.
    let sender_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let receiver_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sender_addr = sender_socket.local_addr().unwrap();
    let receiver_addr = receiver_socket.local_addr().unwrap();

    let recv_progress = Arc::new(ReceiveProgress::new());
    let recv_config = ReceiverConfig {
        output_path: output.clone(),
        transfer_id,
        block_size: BLOCK_SIZE,
        total_blocks,
        producer_addr: sender_addr,
        pre_bound_socket: Some(receiver_socket),
    };
    let recv_progress_thread = recv_progress.clone();
    let receiver = thread::spawn(move || run_receiver(recv_config, recv_progress_thread));

    let send_progress = Arc::new(SendProgress::new());
    let send_config = SenderConfig {
        file_path: source,
        target_addr: receiver_addr,
        transfer_id,
        block_size: BLOCK_SIZE,
        total_blocks,
        pre_bound_socket: Some(sender_socket),
    };
    run_sender(send_config, send_progress.clone()).unwrap();
    assert_eq!(send_progress.blocks_sent.load(Ordering::Relaxed), total_blocks);

    receiver.join().unwrap().unwrap();
    assert_eq!(recv_progress.state.load(Ordering::Relaxed), STATE_COMPLETE);
    assert_eq!(recv_progress.missing_blocks.load(Ordering::Relaxed), 0);
    assert_eq!(
        recv_progress.blocks_received.load(Ordering::Relaxed),
        total_blocks
    );

    let received = fs::read(&output).unwrap();
    assert_eq!(received, payload);

    let _ = fs::remove_dir_all(&dir);
}
