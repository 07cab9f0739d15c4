//! UDP wire format for block transfer.
//!
//! ```text
//! [0]       Content type (0x01 data, 0x02 keep-alive)
//! [1..5]    Serial number (u32 BE) — zero-based block index
//! [5..21]   Transfer ID (UUID, 16 bytes)
//! [21..25]  Timestamp as millisecond offset from transfer start (u32 BE)
//! [25..27]  Data size (u16 BE)
//! [27..]    Payload (up to 65480 bytes)
//! ```
//!
//! 27-byte header, all integers big-endian. Timestamps ride the wire as a
//! delta against a transfer start instant each side captures locally, so a
//! u32 of milliseconds covers ~49 days of transfer.

use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Block payload packet.
pub const CONTENT_TYPE_DATA: u8 = 0x01;

/// Empty keep-alive ping that holds the NAT pinhole open.
pub const CONTENT_TYPE_KEEPALIVE: u8 = 0x02;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 27;

/// Largest datagram the receiver will accept (UDP payload ceiling).
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet exceeds wire field limits")]
    DataTooLarge,
    #[error("timestamp offset does not fit in 32 bits of milliseconds")]
    TimestampTooLarge,
    #[error("data too short to contain packet header")]
    ShortHeader,
    #[error("declared data size does not match available data")]
    SizeMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub content_type: u8,
    pub serial_number: u64,
    pub transfer_id: Uuid,
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
}

impl UdpPacket {
    /// Data packet for block `serial_number`, stamped with the current time.
    pub fn data(serial_number: u64, transfer_id: Uuid, data: Vec<u8>) -> Self {
        Self {
            content_type: CONTENT_TYPE_DATA,
            serial_number,
            transfer_id,
            timestamp: SystemTime::now(),
            data,
        }
    }

    /// Empty keep-alive ping.
    pub fn keepalive(transfer_id: Uuid) -> Self {
        Self {
            content_type: CONTENT_TYPE_KEEPALIVE,
            serial_number: 0,
            transfer_id,
            timestamp: SystemTime::now(),
            data: Vec::new(),
        }
    }

    /// Serialize against `transfer_start`, the reference instant the
    /// timestamp offset is measured from.
    pub fn marshal(&self, transfer_start: SystemTime) -> Result<Vec<u8>, PacketError> {
        if self.data.len() > u16::MAX as usize {
            return Err(PacketError::DataTooLarge);
        }
        if self.serial_number > u32::MAX as u64 {
            return Err(PacketError::DataTooLarge);
        }
        let offset_ms = self
            .timestamp
            .duration_since(transfer_start)
            .map_err(|_| PacketError::TimestampTooLarge)?
            .as_millis();
        if offset_ms > u32::MAX as u128 {
            return Err(PacketError::TimestampTooLarge);
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        buf.push(self.content_type);
        buf.extend_from_slice(&(self.serial_number as u32).to_be_bytes());
        buf.extend_from_slice(self.transfer_id.as_bytes());
        buf.extend_from_slice(&(offset_ms as u32).to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse a datagram received against the same `transfer_start` the
    /// sender marshalled with.
    pub fn unmarshal(bytes: &[u8], transfer_start: SystemTime) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::ShortHeader);
        }
        let data_size = u16::from_be_bytes(bytes[25..27].try_into().unwrap()) as usize;
        if bytes.len() != HEADER_SIZE + data_size {
            return Err(PacketError::SizeMismatch);
        }

        let serial_number = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as u64;
        let transfer_id = Uuid::from_bytes(bytes[5..21].try_into().unwrap());
        let offset_ms = u32::from_be_bytes(bytes[21..25].try_into().unwrap());

        Ok(Self {
            content_type: bytes[0],
            serial_number,
            transfer_id,
            timestamp: transfer_start + Duration::from_millis(offset_ms as u64),
            data: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}
