//! The UDP data plane: block bookkeeping, the wire packet format, and the
//! blocking sender/receiver pipelines that move file bytes between peers.
//!
//! Everything here is runtime-agnostic; the pipelines run on plain threads
//! with blocking sockets and are driven through atomics, so binaries can
//! host them under tokio via `spawn_blocking` or dedicated threads.

pub mod bitarray;
pub mod packet;
pub mod receiver;
pub mod sender;

pub use bitarray::BitArray;
pub use packet::{PacketError, UdpPacket, CONTENT_TYPE_DATA, CONTENT_TYPE_KEEPALIVE};
