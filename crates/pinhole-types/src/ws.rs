//! WebSocket control-message contract between the signaller and producers.
//!
//! The signaller originates requests; the producer replies with a frame
//! carrying the same `request_id`. A reply with an `error` field fails the
//! request, anything else resolves it. Frames without a matching
//! `request_id` are ignored by the signaller's receive loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::UdpOptions;

/// Request type for transfer negotiation.
pub const REQUEST_TYPE_INIT_TRANSFER: &str = "init_transfer";

/// Signaller → producer request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    pub producer_id: Uuid,
    /// Correlation id. The multiplexer fills it in when empty.
    #[serde(default)]
    pub request_id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub data: Value,
}

/// Producer → signaller response frame. Exactly one of `data` / `error`
/// is meaningful. `producer_id` may be absent on the wire; the receiving
/// multiplexer stamps it from the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(default = "Uuid::nil")]
    pub producer_id: Uuid,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of an `init_transfer` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitTransferRequestData {
    pub transfer_id: Uuid,
    pub file_id: Uuid,
    pub block_size: u64,
    pub blocks_count: u64,
    pub consumer_id: Uuid,
    pub consumer_udp_options: UdpOptions,
}

/// Producer's verdict on a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTransferStatus {
    Accepted,
    Rejected,
}

/// Payload of an `init_transfer` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitTransferResponseData {
    pub status: RequestTransferStatus,
    /// Present when accepted: the freshly re-measured producer endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_udp_options: Option<UdpOptions>,
}
