//! Request/response bodies for the signaller HTTP API.
//!
//! All bodies are JSON with snake_case field names.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UdpOptions;

// -- POST /api/producers --

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterProducerRequest {
    pub udp_options: UdpOptions,
}

/// Shared `{"id": ...}` response for both registration endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: Uuid,
}

// -- POST /api/files --

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterFileRequest {
    pub name: String,
    pub size: u64,
    pub producer_id: Uuid,
    /// Hex-encoded SHA-256 of the file content. Optional; older clients
    /// register without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

// -- POST /api/initDownload --

#[derive(Debug, Serialize, Deserialize)]
pub struct InitDownloadRequest {
    /// File id to download.
    pub id: Uuid,
    pub client_udp_options: UdpOptions,
}

/// Everything the consumer needs to start listening for blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitTransferResult {
    pub transfer_id: Uuid,
    pub producer_udp_options: UdpOptions,
    pub block_size: u64,
    pub total_blocks: u64,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
