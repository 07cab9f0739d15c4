use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The UDP endpoint a peer is currently reachable at, as observed from the
/// public internet (via STUN). Producers re-measure this before every
/// accepted transfer; NAT bindings do not survive idleness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpOptions {
    pub external_ip: String,
    pub external_port: u16,
}

/// A peer that registers files and serves their bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub id: Uuid,
    pub udp_options: UdpOptions,
}

impl Producer {
    pub fn new(udp_options: UdpOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            udp_options,
        }
    }
}

/// One download attempt by one peer. A fresh consumer identity is minted
/// per transfer; it is not a long-lived account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consumer {
    pub id: Uuid,
    pub udp_options: UdpOptions,
}

impl Consumer {
    pub fn new(udp_options: UdpOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            udp_options,
        }
    }
}

/// Metadata for a registered file. Immutable once registered; the backing
/// bytes stay on the producer's disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<u8>,
    pub producer_id: Uuid,
}

impl FileMeta {
    pub fn new(name: String, size: u64, hash: Vec<u8>, producer_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            size,
            hash,
            producer_id,
        }
    }
}

/// Lifecycle of a negotiated transfer as seen by the signaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Created,
    ProducerAccepted,
    ProducerRejected,
    Failed,
    DataSending,
    Complete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_status_serializes_snake_case() {
        let s = serde_json::to_string(&TransferStatus::ProducerAccepted).unwrap();
        assert_eq!(s, "\"producer_accepted\"");
    }

    #[test]
    fn file_meta_hash_omitted_when_empty() {
        let meta = FileMeta::new("a.bin".into(), 4096, Vec::new(), Uuid::new_v4());
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("hash").is_none());
        assert_eq!(json["size"], 4096);
    }
}
