use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use pinhole_types::api::{
    ErrorResponse, IdResponse, InitDownloadRequest, RegisterFileRequest, RegisterProducerRequest,
};

use crate::registry::{FileRegistry, ProducerRegistry};
use crate::transfers::TransferCoordinator;
use crate::ws::WsMultiplexer;

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub producers: Arc<ProducerRegistry>,
    pub files: Arc<FileRegistry>,
    pub transfers: Arc<TransferCoordinator>,
    pub ws: Arc<WsMultiplexer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/producers", post(register_producer))
        .route("/api/files", post(register_file))
        .route("/api/initDownload", post(init_download))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

/// POST /api/producers — register a producer, returns its id.
async fn register_producer(
    State(state): State<AppState>,
    Json(req): Json<RegisterProducerRequest>,
) -> Json<IdResponse> {
    let id = state.producers.register(req.udp_options);
    Json(IdResponse { id })
}

/// POST /api/files — register a file for an existing producer.
async fn register_file(
    State(state): State<AppState>,
    Json(req): Json<RegisterFileRequest>,
) -> Response {
    let hash = match req.hash.as_deref() {
        Some(h) => match hex::decode(h) {
            Ok(bytes) => bytes,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid hash encoding"),
        },
        None => Vec::new(),
    };

    match state.files.register(req.name, req.size, hash, req.producer_id) {
        Ok(id) => Json(IdResponse { id }).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// POST /api/initDownload — negotiate a transfer with the owning producer.
async fn init_download(
    State(state): State<AppState>,
    Json(req): Json<InitDownloadRequest>,
) -> Response {
    match state
        .transfers
        .init_transfer(req.id, req.client_udp_options)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            warn!(file_id = %req.id, error = %e, "init download failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to init download: {e}"),
            )
        }
    }
}

#[derive(Deserialize)]
struct WsQuery {
    producer_id: Option<String>,
}

/// GET /ws?producer_id=<uuid> — upgrade and hand the socket to the
/// multiplexer. The upgraded connection runs in its own task, so a panic
/// there cannot take the server down with it.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(producer_id) = query.producer_id else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "producer_id query parameter is required",
        );
    };
    let Ok(producer_id) = Uuid::parse_str(&producer_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid producer_id format");
    };

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = state.ws.handle_connection(producer_id, socket).await {
            warn!(%producer_id, error = %e, "websocket connection rejected");
        }
    })
}
