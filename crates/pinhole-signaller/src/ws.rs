//! Per-producer WebSocket multiplexer.
//!
//! One live connection per producer id. The signaller originates
//! request/response pairs over it: each request carries a `request_id`,
//! and the connection's receive loop routes reply frames back to the
//! blocked caller through a one-shot channel. Sending on a one-shot never
//! blocks, so a caller that already timed out (and whose pending entry was
//! removed) simply causes the late reply to be dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pinhole_types::ws::{WsRequest, WsResponse};

use crate::registry::ProducerRegistry;

/// Bound on server-originated request round-trips.
pub const DEFAULT_WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("producer not found")]
    ProducerNotRegistered,
    #[error("producer not connected")]
    ProducerNotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timeout waiting for response")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Remote(String),
}

type PendingSender = oneshot::Sender<Result<WsResponse, WsError>>;

struct ProducerConnection {
    /// Outbound half. WebSocket writes are not concurrency-safe; every
    /// sender goes through this mutex.
    sink: Mutex<SplitSink<WebSocket, Message>>,
    /// request_id → waiting caller. Guarded separately from the sink so
    /// routing inbound frames never contends with outbound writes.
    pending: RwLock<HashMap<String, PendingSender>>,
    /// Fired when a newer connection replaces this one.
    replaced: Notify,
}

/// Tracks the live WebSocket per producer and correlates request/response
/// pairs across it.
pub struct WsMultiplexer {
    connections: RwLock<HashMap<Uuid, Arc<ProducerConnection>>>,
    producers: Arc<ProducerRegistry>,
}

impl WsMultiplexer {
    pub fn new(producers: Arc<ProducerRegistry>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            producers,
        }
    }

    /// Adopt an upgraded socket for `producer_id` and run its receive loop
    /// until the peer goes away. A second connection for the same producer
    /// displaces the first.
    pub async fn handle_connection(
        &self,
        producer_id: Uuid,
        socket: WebSocket,
    ) -> Result<(), WsError> {
        self.producers
            .get(producer_id)
            .map_err(|_| WsError::ProducerNotRegistered)?;

        let (sink, mut stream) = socket.split();
        let conn = Arc::new(ProducerConnection {
            sink: Mutex::new(sink),
            pending: RwLock::new(HashMap::new()),
            replaced: Notify::new(),
        });

        let previous = self
            .connections
            .write()
            .insert(producer_id, conn.clone());
        if let Some(previous) = previous {
            info!(%producer_id, "replacing existing producer connection");
            previous.replaced.notify_one();
            let mut sink = previous.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }

        info!(%producer_id, "producer websocket connection registered");

        loop {
            tokio::select! {
                _ = conn.replaced.notified() => {
                    debug!(%producer_id, "connection displaced by a newer one");
                    break;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.route_frame(&conn, producer_id, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%producer_id, "producer websocket closed");
                        break;
                    }
                    Some(Ok(_)) => {} // binary / ping / pong — nothing to route
                    Some(Err(e)) => {
                        info!(%producer_id, error = %e, "producer websocket error");
                        break;
                    }
                }
            }
        }

        // Fail every caller still waiting on this connection.
        for (_, tx) in conn.pending.write().drain() {
            let _ = tx.send(Err(WsError::ConnectionClosed));
        }

        // Deregister, unless a replacement already took the slot.
        let mut connections = self.connections.write();
        if let Some(current) = connections.get(&producer_id) {
            if Arc::ptr_eq(current, &conn) {
                connections.remove(&producer_id);
                info!(%producer_id, "producer websocket connection removed");
            }
        }
        Ok(())
    }

    /// Route one inbound text frame. Frames that do not correlate to a
    /// pending request are logged and dropped.
    fn route_frame(&self, conn: &ProducerConnection, producer_id: Uuid, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                debug!(%producer_id, "ignoring non-json frame");
                return;
            }
        };
        let Some(request_id) = value.get("request_id").and_then(|v| v.as_str()) else {
            debug!(%producer_id, "ignoring frame without request_id");
            return;
        };
        let Some(tx) = conn.pending.write().remove(request_id) else {
            debug!(%producer_id, request_id, "no pending request for frame");
            return;
        };

        debug!(%producer_id, request_id, "received response for pending request");
        let outcome = if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
            Err(WsError::Remote(error.to_string()))
        } else {
            match serde_json::from_value::<WsResponse>(value) {
                Ok(mut response) => {
                    response.producer_id = producer_id;
                    Ok(response)
                }
                Err(_) => Err(WsError::Transport("failed to parse response".into())),
            }
        };
        let _ = tx.send(outcome);
    }

    /// Send a request to the producer and await its correlated reply, or
    /// fail after `timeout`. An empty `request_id` is filled in here.
    pub async fn request_with_timeout(
        &self,
        mut request: WsRequest,
        timeout: Duration,
    ) -> Result<WsResponse, WsError> {
        let conn = self
            .connections
            .read()
            .get(&request.producer_id)
            .cloned()
            .ok_or(WsError::ProducerNotConnected)?;

        if request.request_id.is_empty() {
            request.request_id = Uuid::new_v4().to_string();
        }
        let request_id = request.request_id.clone();

        let (tx, rx) = oneshot::channel();
        conn.pending.write().insert(request_id.clone(), tx);

        let frame = match serde_json::to_string(&request) {
            Ok(f) => f,
            Err(e) => {
                conn.pending.write().remove(&request_id);
                return Err(WsError::Transport(e.to_string()));
            }
        };
        {
            let mut sink = conn.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                conn.pending.write().remove(&request_id);
                return Err(WsError::Transport(e.to_string()));
            }
        }

        debug!(
            producer_id = %request.producer_id,
            request_id,
            request_type = %request.request_type,
            "sent request, awaiting response"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(WsError::ConnectionClosed),
            Err(_) => {
                // Remove the entry first so a late reply is dropped by the
                // receive loop instead of resolving a dead request.
                conn.pending.write().remove(&request_id);
                warn!(request_id, "request timed out");
                Err(WsError::Timeout)
            }
        }
    }

}

/// Seam between the transfer coordinator and the producer transport, so
/// coordinator tests can stand in a scripted producer.
#[async_trait]
pub trait ProducerChannel: Send + Sync {
    async fn request_with_timeout(
        &self,
        request: WsRequest,
        timeout: Duration,
    ) -> Result<WsResponse, WsError>;
}

#[async_trait]
impl ProducerChannel for WsMultiplexer {
    async fn request_with_timeout(
        &self,
        request: WsRequest,
        timeout: Duration,
    ) -> Result<WsResponse, WsError> {
        WsMultiplexer::request_with_timeout(self, request, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_without_connection_fails_fast() {
        let producers = Arc::new(ProducerRegistry::new());
        let multiplexer = WsMultiplexer::new(producers.clone());
        let producer_id = producers.register(pinhole_types::models::UdpOptions {
            external_ip: "198.51.100.7".into(),
            external_port: 40001,
        });

        let request = WsRequest {
            producer_id,
            request_id: String::new(),
            request_type: "init_transfer".into(),
            data: serde_json::Value::Null,
        };
        let err = multiplexer
            .request_with_timeout(request, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::ProducerNotConnected));
    }
}
