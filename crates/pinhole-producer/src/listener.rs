//! Long-lived WebSocket listener.
//!
//! Holds one connection to the signaller and answers its correlated
//! requests. For `init_transfer`: check the file is still on disk,
//! re-measure the external endpoint via STUN, reply accepted with the
//! fresh address, then hand the actual byte-pushing to the send service.
//! Every reply frame echoes the request's `request_id`.

use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use uuid::Uuid;

use pinhole_peer::config::{PeerConfig, StunConfig};
use pinhole_peer::resolve_endpoint;
use pinhole_peer::state::StateStore;
use pinhole_peer::stun::StunClient;
use pinhole_types::models::UdpOptions;
use pinhole_types::ws::{
    InitTransferRequestData, InitTransferResponseData, RequestTransferStatus, WsRequest,
    WsResponse, REQUEST_TYPE_INIT_TRANSFER,
};

use crate::transfer::SendService;

pub async fn run(config: &PeerConfig, producer_id: Uuid, state: StateStore) -> anyhow::Result<()> {
    let url = ws_url(&config.signaller.url, producer_id);
    info!(%url, "connecting to signaller websocket");

    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .context("websocket connect failed")?;
    info!("connected, serving transfer requests");
    let (mut ws_tx, mut ws_rx) = stream.split();

    let listener = Arc::new(Listener {
        producer_id,
        stun: config.stun.clone(),
        state,
        sends: SendService::new(),
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down listener");
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // Run each request in its own task so a panic in
                    // transfer setup cannot take the listener down.
                    let handler = listener.clone();
                    let response = match tokio::spawn(async move {
                        handler.handle_frame(text.as_str()).await
                    })
                    .await
                    {
                        Ok(response) => response,
                        Err(e) => {
                            error!(error = %e, "request handler panicked");
                            None
                        }
                    };
                    if let Some(response) = response {
                        let json = match serde_json::to_string(&response) {
                            Ok(j) => j,
                            Err(e) => {
                                error!(error = %e, "failed to encode response");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            warn!("websocket send failed, closing");
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("connection closed by signaller");
                    break;
                }
                Some(Ok(_)) => {} // binary / ping / pong
                Some(Err(e)) => {
                    error!(error = %e, "websocket error");
                    break;
                }
            }
        }
    }
    Ok(())
}

struct Listener {
    producer_id: Uuid,
    stun: StunConfig,
    state: StateStore,
    sends: SendService,
}

impl Listener {
    async fn handle_frame(&self, text: &str) -> Option<WsResponse> {
        let request: WsRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(_) => {
                warn!("ignoring non-json message: {}", &text[..text.len().min(200)]);
                return None;
            }
        };

        match request.request_type.as_str() {
            REQUEST_TYPE_INIT_TRANSFER => Some(self.handle_init_transfer(request).await),
            other => {
                warn!(request_type = other, "unknown request type");
                Some(WsResponse {
                    producer_id: self.producer_id,
                    request_id: request.request_id,
                    data: None,
                    error: Some(format!("unknown request type: {other}")),
                })
            }
        }
    }

    async fn handle_init_transfer(&self, request: WsRequest) -> WsResponse {
        let request_id = request.request_id;
        let data: InitTransferRequestData = match serde_json::from_value(request.data) {
            Ok(data) => data,
            Err(_) => return self.error(request_id, "failed to parse request data"),
        };

        let entry = match self.state.get_file(data.file_id) {
            Some(entry) => entry.clone(),
            None => return self.reject(request_id, "file not found".into()),
        };
        if let Err(e) = std::fs::metadata(&entry.file_path) {
            return self.reject(request_id, format!("file does not exist: {e}"));
        }

        // The endpoint registered earlier is stale by now; measure again so
        // the consumer gets the address this NAT will actually map.
        let stun = StunClient::new(
            self.stun.servers.clone(),
            self.stun.local_port,
            self.stun.timeout(),
        );
        let external = match tokio::task::spawn_blocking(move || stun.query()).await {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                return self.reject(request_id, format!("failed to reevaluate udp options: {e}"))
            }
            Err(e) => {
                return self.reject(request_id, format!("failed to reevaluate udp options: {e}"))
            }
        };
        let udp_options = UdpOptions {
            external_ip: external.ip().to_string(),
            external_port: external.port(),
        };

        let consumer_addr = match resolve_endpoint(&data.consumer_udp_options) {
            Ok(addr) => addr,
            Err(e) => return self.reject(request_id, format!("bad consumer address: {e}")),
        };

        info!(
            transfer_id = %data.transfer_id,
            file_id = %data.file_id,
            consumer = %consumer_addr,
            block_size = data.block_size,
            total_blocks = data.blocks_count,
            "accepting transfer"
        );

        if let Err(e) = self.sends.start_transfer(
            &self.state,
            data.transfer_id,
            data.file_id,
            data.block_size,
            data.blocks_count,
            consumer_addr,
        ) {
            error!(transfer_id = %data.transfer_id, error = %e, "failed to start transfer");
        }

        WsResponse {
            producer_id: self.producer_id,
            request_id,
            data: Some(
                serde_json::to_value(InitTransferResponseData {
                    status: RequestTransferStatus::Accepted,
                    producer_udp_options: Some(udp_options),
                })
                .expect("response data serializes"),
            ),
            error: None,
        }
    }

    fn reject(&self, request_id: String, reason: String) -> WsResponse {
        info!(reason, "rejecting transfer request");
        WsResponse {
            producer_id: self.producer_id,
            request_id,
            data: Some(
                serde_json::to_value(InitTransferResponseData {
                    status: RequestTransferStatus::Rejected,
                    producer_udp_options: None,
                })
                .expect("response data serializes"),
            ),
            error: None,
        }
    }

    fn error(&self, request_id: String, message: &str) -> WsResponse {
        WsResponse {
            producer_id: self.producer_id,
            request_id,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Derive the websocket endpoint from the configured signaller URL.
fn ws_url(base: &str, producer_id: Uuid) -> String {
    let base = base.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/ws?producer_id={producer_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_upgrades_scheme() {
        let id = Uuid::nil();
        assert_eq!(
            ws_url("http://localhost:8080", id),
            format!("ws://localhost:8080/ws?producer_id={id}")
        );
        assert_eq!(
            ws_url("https://signal.example/", id),
            format!("wss://signal.example/ws?producer_id={id}")
        );
    }
}
