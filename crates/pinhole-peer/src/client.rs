//! REST client for the signaller HTTP API.

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use pinhole_types::api::{
    IdResponse, InitDownloadRequest, InitTransferResult, RegisterFileRequest,
    RegisterProducerRequest,
};
use pinhole_types::models::UdpOptions;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },
}

pub struct SignallerClient {
    base_url: String,
    http: reqwest::Client,
}

impl SignallerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn register_producer(&self, udp_options: UdpOptions) -> Result<Uuid, ClientError> {
        let response: IdResponse = self
            .post_json("/api/producers", &RegisterProducerRequest { udp_options })
            .await?;
        Ok(response.id)
    }

    pub async fn register_file(
        &self,
        name: String,
        size: u64,
        hash: Option<String>,
        producer_id: Uuid,
    ) -> Result<Uuid, ClientError> {
        let response: IdResponse = self
            .post_json(
                "/api/files",
                &RegisterFileRequest {
                    name,
                    size,
                    producer_id,
                    hash,
                },
            )
            .await?;
        Ok(response.id)
    }

    pub async fn init_download(
        &self,
        file_id: Uuid,
        client_udp_options: UdpOptions,
    ) -> Result<InitTransferResult, ClientError> {
        self.post_json(
            "/api/initDownload",
            &InitDownloadRequest {
                id: file_id,
                client_udp_options,
            },
        )
        .await
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}
