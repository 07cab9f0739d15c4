//! Transfer negotiation.
//!
//! `init_transfer` is the three-party handshake: look up the file, mint a
//! consumer identity, ask the owning producer over its WebSocket, record
//! the endpoint the producer re-measured on accept, and hand the result to
//! the consumer. The signaller never touches payload bytes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use pinhole_transfer::BitArray;
use pinhole_types::api::InitTransferResult;
use pinhole_types::models::{Consumer, FileMeta, TransferStatus, UdpOptions};
use pinhole_types::ws::{
    InitTransferRequestData, InitTransferResponseData, RequestTransferStatus, WsRequest,
    REQUEST_TYPE_INIT_TRANSFER,
};

use crate::registry::{FileRegistry, ProducerRegistry, RegistryError};
use crate::ws::{ProducerChannel, WsError, DEFAULT_WS_REQUEST_TIMEOUT};

/// Fixed block size for this protocol version. This exact value rides in
/// the producer request and in the consumer result; the two must never
/// disagree.
pub const BLOCK_SIZE: u64 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Channel(#[from] WsError),
    #[error("invalid response data")]
    InvalidResponseData,
    #[error("producer rejected transfer")]
    ProducerRejected,
    #[error("transfer not found")]
    NotFound,
}

/// One negotiated download, as the signaller tracks it.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: Uuid,
    pub file_meta: FileMeta,
    pub consumer: Consumer,
    pub status: TransferStatus,
    pub total_blocks: u64,
    pub block_size: u64,
    pub received_blocks: BitArray,
    pub failed_blocks: BitArray,
    pub sent_blocks: BitArray,
}

impl Transfer {
    fn new(file_meta: FileMeta, consumer: Consumer, block_size: u64) -> Self {
        let total_blocks = file_meta.size.div_ceil(block_size);
        Self {
            id: Uuid::new_v4(),
            file_meta,
            consumer,
            status: TransferStatus::Created,
            total_blocks,
            block_size,
            received_blocks: BitArray::new(total_blocks),
            failed_blocks: BitArray::new(total_blocks),
            sent_blocks: BitArray::new(total_blocks),
        }
    }
}

pub struct TransferCoordinator {
    transfers: RwLock<HashMap<Uuid, Transfer>>,
    files: Arc<FileRegistry>,
    producers: Arc<ProducerRegistry>,
    channel: Arc<dyn ProducerChannel>,
}

impl TransferCoordinator {
    pub fn new(
        files: Arc<FileRegistry>,
        producers: Arc<ProducerRegistry>,
        channel: Arc<dyn ProducerChannel>,
    ) -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
            files,
            producers,
            channel,
        }
    }

    /// Negotiate a download of `file_id` for a consumer reachable at
    /// `consumer_udp_options`.
    pub async fn init_transfer(
        &self,
        file_id: Uuid,
        consumer_udp_options: UdpOptions,
    ) -> Result<InitTransferResult, TransferError> {
        let file_meta = self.files.get_file_meta(file_id)?;
        let consumer = Consumer::new(consumer_udp_options);
        let consumer_id = consumer.id;

        let transfer = Transfer::new(file_meta.clone(), consumer.clone(), BLOCK_SIZE);
        let transfer_id = transfer.id;
        let total_blocks = transfer.total_blocks;
        self.transfers.write().insert(transfer_id, transfer);

        let data = InitTransferRequestData {
            transfer_id,
            file_id: file_meta.id,
            block_size: BLOCK_SIZE,
            blocks_count: total_blocks,
            consumer_id,
            consumer_udp_options: consumer.udp_options,
        };
        let request = WsRequest {
            producer_id: file_meta.producer_id,
            request_id: String::new(),
            request_type: REQUEST_TYPE_INIT_TRANSFER.into(),
            data: serde_json::to_value(&data).expect("request data serializes"),
        };

        let response = match self
            .channel
            .request_with_timeout(request, DEFAULT_WS_REQUEST_TIMEOUT)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(%transfer_id, error = %e, "producer request failed");
                self.set_status(transfer_id, TransferStatus::Failed);
                return Err(e.into());
            }
        };

        let response_data: InitTransferResponseData = match response
            .data
            .and_then(|v| serde_json::from_value(v).ok())
        {
            Some(data) => data,
            None => {
                self.set_status(transfer_id, TransferStatus::Failed);
                return Err(TransferError::InvalidResponseData);
            }
        };

        if response_data.status == RequestTransferStatus::Rejected {
            info!(%transfer_id, "producer rejected transfer");
            self.set_status(transfer_id, TransferStatus::ProducerRejected);
            return Err(TransferError::ProducerRejected);
        }

        let Some(producer_udp_options) = response_data.producer_udp_options else {
            self.set_status(transfer_id, TransferStatus::Failed);
            return Err(TransferError::InvalidResponseData);
        };

        self.set_status(transfer_id, TransferStatus::ProducerAccepted);
        // Record the re-measured endpoint before the consumer sees it, so
        // later lookups agree with the address in the result.
        self.producers
            .update_udp_options(file_meta.producer_id, producer_udp_options.clone())?;

        info!(
            %transfer_id,
            producer_id = %file_meta.producer_id,
            total_blocks,
            "transfer accepted"
        );

        Ok(InitTransferResult {
            transfer_id,
            producer_udp_options,
            block_size: BLOCK_SIZE,
            total_blocks,
        })
    }

    pub fn get_transfer(&self, id: Uuid) -> Result<Transfer, TransferError> {
        self.transfers
            .read()
            .get(&id)
            .cloned()
            .ok_or(TransferError::NotFound)
    }

    /// Fold a peer-reported window of received blocks into the transfer's
    /// bookkeeping. The retransmission loop that would consume this is not
    /// part of this protocol version; the state is kept current for it.
    pub fn acknowledge_blocks(
        &self,
        transfer_id: Uuid,
        offset: u64,
        blocks: &BitArray,
    ) -> Result<(), TransferError> {
        let mut transfers = self.transfers.write();
        let transfer = transfers
            .get_mut(&transfer_id)
            .ok_or(TransferError::NotFound)?;
        transfer.received_blocks.or(offset, blocks);
        Ok(())
    }

    fn set_status(&self, transfer_id: Uuid, status: TransferStatus) {
        if let Some(transfer) = self.transfers.write().get_mut(&transfer_id) {
            transfer.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use pinhole_types::ws::WsResponse;

    /// Scripted stand-in for the producer side of the WebSocket.
    struct ScriptedChannel {
        outcome: Box<dyn Fn(&WsRequest) -> Result<WsResponse, WsError> + Send + Sync>,
        requests: Mutex<Vec<WsRequest>>,
    }

    impl ScriptedChannel {
        fn new(
            outcome: impl Fn(&WsRequest) -> Result<WsResponse, WsError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                outcome: Box::new(outcome),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn last_request(&self) -> WsRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ProducerChannel for ScriptedChannel {
        async fn request_with_timeout(
            &self,
            request: WsRequest,
            _timeout: Duration,
        ) -> Result<WsResponse, WsError> {
            let outcome = (self.outcome)(&request);
            self.requests.lock().unwrap().push(request);
            outcome
        }
    }

    fn accept_response(request: &WsRequest, udp: UdpOptions) -> Result<WsResponse, WsError> {
        Ok(WsResponse {
            producer_id: request.producer_id,
            request_id: request.request_id.clone(),
            data: Some(
                serde_json::to_value(InitTransferResponseData {
                    status: RequestTransferStatus::Accepted,
                    producer_udp_options: Some(udp),
                })
                .unwrap(),
            ),
            error: None,
        })
    }

    fn reject_response(request: &WsRequest) -> Result<WsResponse, WsError> {
        Ok(WsResponse {
            producer_id: request.producer_id,
            request_id: request.request_id.clone(),
            data: Some(
                serde_json::to_value(InitTransferResponseData {
                    status: RequestTransferStatus::Rejected,
                    producer_udp_options: None,
                })
                .unwrap(),
            ),
            error: None,
        })
    }

    fn setup(
        channel: Arc<ScriptedChannel>,
    ) -> (Arc<ProducerRegistry>, Uuid, Uuid, TransferCoordinator) {
        let producers = Arc::new(ProducerRegistry::new());
        let files = Arc::new(FileRegistry::new(producers.clone()));

        let producer_id = producers.register(UdpOptions {
            external_ip: "198.51.100.7".into(),
            external_port: 40001,
        });
        let file_id = files
            .register("a.bin".into(), 4096, Vec::new(), producer_id)
            .unwrap();

        let coordinator = TransferCoordinator::new(files, producers.clone(), channel);
        (producers, producer_id, file_id, coordinator)
    }

    fn consumer_opts() -> UdpOptions {
        UdpOptions {
            external_ip: "203.0.113.9".into(),
            external_port: 50000,
        }
    }

    #[tokio::test]
    async fn happy_path_returns_fresh_producer_endpoint() {
        let fresh = UdpOptions {
            external_ip: "198.51.100.7".into(),
            external_port: 40500,
        };
        let fresh_for_channel = fresh.clone();
        let channel =
            ScriptedChannel::new(move |req| accept_response(req, fresh_for_channel.clone()));
        let (producers, producer_id, file_id, coordinator) = setup(channel.clone());

        let result = coordinator
            .init_transfer(file_id, consumer_opts())
            .await
            .unwrap();

        assert_eq!(result.block_size, 1024);
        assert_eq!(result.total_blocks, 4);
        assert_eq!(result.producer_udp_options, fresh);

        // The accepted endpoint must be visible through the registry.
        assert_eq!(producers.get(producer_id).unwrap().udp_options, fresh);

        let transfer = coordinator.get_transfer(result.transfer_id).unwrap();
        assert_eq!(transfer.status, TransferStatus::ProducerAccepted);
        assert_eq!(transfer.received_blocks.len(), 4);
    }

    #[tokio::test]
    async fn request_carries_negotiated_block_size_not_file_size() {
        let channel = ScriptedChannel::new(|req| {
            accept_response(
                req,
                UdpOptions {
                    external_ip: "198.51.100.7".into(),
                    external_port: 40500,
                },
            )
        });
        let (_, _, file_id, coordinator) = setup(channel.clone());

        let result = coordinator
            .init_transfer(file_id, consumer_opts())
            .await
            .unwrap();

        let request = channel.last_request();
        assert_eq!(request.request_type, "init_transfer");
        let data: InitTransferRequestData = serde_json::from_value(request.data).unwrap();
        assert_eq!(data.block_size, 1024);
        assert_eq!(data.blocks_count, 4);
        assert_eq!(data.transfer_id, result.transfer_id);
        assert_eq!(data.consumer_udp_options, consumer_opts());
    }

    #[tokio::test]
    async fn producer_rejection_is_terminal() {
        let channel = ScriptedChannel::new(reject_response);
        let (_, _, file_id, coordinator) = setup(channel);

        let err = coordinator
            .init_transfer(file_id, consumer_opts())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProducerRejected));

        let transfer = only_transfer(&coordinator);
        assert_eq!(transfer.status, TransferStatus::ProducerRejected);
    }

    #[tokio::test]
    async fn disconnected_producer_fails_the_transfer() {
        let channel = ScriptedChannel::new(|_| Err(WsError::ProducerNotConnected));
        let (_, _, file_id, coordinator) = setup(channel);

        let err = coordinator
            .init_transfer(file_id, consumer_opts())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Channel(WsError::ProducerNotConnected)
        ));
        assert_eq!(only_transfer(&coordinator).status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn producer_timeout_fails_the_transfer() {
        let channel = ScriptedChannel::new(|_| Err(WsError::Timeout));
        let (_, _, file_id, coordinator) = setup(channel);

        let err = coordinator
            .init_transfer(file_id, consumer_opts())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Channel(WsError::Timeout)));
        assert_eq!(only_transfer(&coordinator).status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn malformed_response_data_fails_the_transfer() {
        let channel = ScriptedChannel::new(|req| {
            Ok(WsResponse {
                producer_id: req.producer_id,
                request_id: req.request_id.clone(),
                data: Some(serde_json::json!({"bogus": true})),
                error: None,
            })
        });
        let (_, _, file_id, coordinator) = setup(channel);

        let err = coordinator
            .init_transfer(file_id, consumer_opts())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidResponseData));
        assert_eq!(only_transfer(&coordinator).status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_file_propagates_not_found() {
        let channel = ScriptedChannel::new(reject_response);
        let (_, _, _, coordinator) = setup(channel);

        let err = coordinator
            .init_transfer(Uuid::new_v4(), consumer_opts())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Registry(RegistryError::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn acknowledge_blocks_folds_into_received() {
        let channel = ScriptedChannel::new(|req| {
            accept_response(
                req,
                UdpOptions {
                    external_ip: "198.51.100.7".into(),
                    external_port: 40500,
                },
            )
        });
        let (_, _, file_id, coordinator) = setup(channel);
        let result = coordinator
            .init_transfer(file_id, consumer_opts())
            .await
            .unwrap();

        let mut window = BitArray::new(2);
        window.set(0);
        window.set(1);
        coordinator
            .acknowledge_blocks(result.transfer_id, 1, &window)
            .unwrap();

        let transfer = coordinator.get_transfer(result.transfer_id).unwrap();
        assert!(!transfer.received_blocks.get(0));
        assert!(transfer.received_blocks.get(1));
        assert!(transfer.received_blocks.get(2));
        assert!(!transfer.received_blocks.get(3));

        assert!(matches!(
            coordinator.acknowledge_blocks(Uuid::new_v4(), 0, &window),
            Err(TransferError::NotFound)
        ));
    }

    fn only_transfer(coordinator: &TransferCoordinator) -> Transfer {
        let transfers = coordinator.transfers.read();
        assert_eq!(transfers.len(), 1);
        transfers.values().next().cloned().unwrap()
    }
}
