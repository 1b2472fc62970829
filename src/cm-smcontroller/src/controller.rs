//! gRPC server accepting SM session registrations and routing
//! fleet-addressed operations to the right session by node id (spec.md
//! §4.6), ported from `smcontroller.hpp`/`smcontroller.cpp`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use cm_ore::error::CmError;
use cm_proto::sm::{self, sm_service_server::SmService};
use futures::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::session::{InboundEvent, ResponseKind, SmSession};

/// Delegated collaborator for the unary `GetBlobsInfos` call (spec.md §1
/// "deliberately out of scope... consumed only via the interfaces").
#[async_trait]
pub trait BlobInfoProvider: Send + Sync {
    async fn get_blob_urls(&self, digests: &[String]) -> Result<HashMap<String, String>, CmError>;
}

const OUTGOING_CHANNEL_CAPACITY: usize = 64;

/// Live SM sessions, keyed by node id, behind a single registry mutex
/// (`mMutex` + `mSMHandlers` in the original).
pub struct SmController {
    sessions: Arc<Mutex<HashMap<String, Arc<SmSession>>>>,
    blob_info_provider: Arc<dyn BlobInfoProvider>,
    events: mpsc::UnboundedSender<InboundEvent>,
}

impl SmController {
    pub fn new(blob_info_provider: Arc<dyn BlobInfoProvider>, events: mpsc::UnboundedSender<InboundEvent>) -> Self {
        SmController { sessions: Arc::new(Mutex::new(HashMap::new())), blob_info_provider, events }
    }

    async fn session(&self, node_id: &str) -> Result<Arc<SmSession>, CmError> {
        self.sessions.lock().await.get(node_id).cloned().ok_or_else(|| CmError::not_found(format!("no session for node {node_id}")))
    }

    pub async fn check_node_config(&self, node_id: &str, version: &str, config: &str) -> Result<sm::NodeConfigStatus, CmError> {
        self.request_config_status(node_id, sm::sm_incoming_message::Payload::CheckNodeConfig(sm::CheckNodeConfig { version: version.to_string(), config: config.to_string() })).await
    }

    pub async fn set_node_config(&self, node_id: &str, version: &str, config: &str) -> Result<sm::NodeConfigStatus, CmError> {
        self.request_config_status(node_id, sm::sm_incoming_message::Payload::SetNodeConfig(sm::SetNodeConfig { version: version.to_string(), config: config.to_string() })).await
    }

    pub async fn get_node_config_status(&self, node_id: &str) -> Result<sm::NodeConfigStatus, CmError> {
        self.request_config_status(node_id, sm::sm_incoming_message::Payload::GetNodeConfigStatus(sm::GetNodeConfigStatus {})).await
    }

    async fn request_config_status(&self, node_id: &str, payload: sm::sm_incoming_message::Payload) -> Result<sm::NodeConfigStatus, CmError> {
        let session = self.session(node_id).await?;
        let response = session.request(payload, ResponseKind::NodeConfigStatus).await?;
        match response.payload {
            Some(sm::sm_outgoing_message::Payload::NodeConfigStatus(status)) => Ok(status),
            _ => Err(CmError::internal("unexpected response to node config request")),
        }
    }

    pub async fn get_average_monitoring(&self, node_id: &str) -> Result<sm::AverageMonitoring, CmError> {
        let session = self.session(node_id).await?;
        let response = session.request(sm::sm_incoming_message::Payload::GetAverageMonitoring(sm::GetAverageMonitoring {}), ResponseKind::AverageMonitoring).await?;
        match response.payload {
            Some(sm::sm_outgoing_message::Payload::AverageMonitoring(data)) => Ok(data),
            _ => Err(CmError::internal("unexpected response to monitoring request")),
        }
    }

    pub async fn update_instances(&self, node_id: &str, stop: Vec<sm::InstanceInfo>, start: Vec<sm::InstanceInfo>) -> Result<(), CmError> {
        let session = self.session(node_id).await?;
        session.send(sm::sm_incoming_message::Payload::UpdateInstances(sm::UpdateInstances { stop_instances: stop, start_instances: start })).await
    }

    pub async fn update_networks(&self, node_id: &str, networks: Vec<sm::UpdateNetworkParameters>) -> Result<(), CmError> {
        let session = self.session(node_id).await?;
        session.send(sm::sm_incoming_message::Payload::UpdateNetworks(sm::UpdateNetworks { networks })).await
    }

    /// Fire-and-forget: the original does not await a typed response either
    /// (spec.md §2).
    pub async fn request_log(&self, node_id: &str, request: sm::RequestLog) -> Result<(), CmError> {
        let session = self.session(node_id).await?;
        session.send(sm::sm_incoming_message::Payload::RequestLog(request)).await
    }

    /// Broadcasts the cloud connection status to every live session under
    /// the registry lock (spec.md §4.6 "fans out cloud-connected/disconnected
    /// events").
    pub async fn broadcast_cloud_connected(&self, connected: bool) {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            let _ = session.send(sm::sm_incoming_message::Payload::ConnectionStatus(sm::ConnectionStatus { cloud_connected: connected })).await;
        }
    }

    /// Signals every session to stop and waits for the registry to drain.
    /// Session teardown itself happens when each gRPC handler task's stream
    /// ends; this only drops the controller's references to them.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        info!(count = sessions.len(), "stopping SM controller");
        sessions.clear();
    }
}

type IncomingStream = Pin<Box<dyn Stream<Item = Result<sm::SmIncomingMessage, Status>> + Send>>;

#[tonic::async_trait]
impl SmService for SmController {
    type RegisterSMStream = IncomingStream;

    async fn register_sm(&self, request: Request<Streaming<sm::SmOutgoingMessage>>) -> Result<Response<Self::RegisterSMStream>, Status> {
        let incoming = request.into_inner();
        let (to_sm, from_sm) = mpsc::channel(OUTGOING_CHANNEL_CAPACITY);
        let session = Arc::new(SmSession::new(to_sm));

        // The registry gains the entry once the node announces its id, not
        // before; until then the session exists only as a reader task. The
        // registration wait and the reader run in the same task via
        // `select!` so a stream that ends before ever sending `NodeInfo`
        // (instead of a fixed 1s timeout that could drop a slow-but-real
        // registration) simply never registers, rather than leaking a
        // waiter task forever.
        let sessions = self.sessions.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let reader = session.run_reader(incoming, events.clone());
            tokio::pin!(reader);

            tokio::select! {
                _ = &mut reader => {}
                node_id = session.wait_for_node_id() => {
                    sessions.lock().await.insert(node_id, session.clone());
                    reader.await;
                }
            }

            if let Some(node_id) = session.node_id().await {
                sessions.lock().await.remove(&node_id);
                debug!(node_id, "SM session ended");
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(from_sm))))
    }

    async fn get_blobs_infos(&self, request: Request<sm::BlobsInfosRequest>) -> Result<Response<sm::BlobsInfos>, Status> {
        let urls = self.blob_info_provider.get_blob_urls(&request.into_inner().digests).await.map_err(to_status)?;
        Ok(Response::new(sm::BlobsInfos { urls }))
    }
}

fn to_status(err: CmError) -> Status {
    use cm_ore::ErrorKind;
    let code = match err.kind() {
        ErrorKind::NotFound => tonic::Code::NotFound,
        ErrorKind::AlreadyExists => tonic::Code::AlreadyExists,
        ErrorKind::InvalidArgument | ErrorKind::BadMessage => tonic::Code::InvalidArgument,
        ErrorKind::PermissionDenied => tonic::Code::PermissionDenied,
        ErrorKind::Timeout => tonic::Code::DeadlineExceeded,
        ErrorKind::Unavailable => tonic::Code::Unavailable,
        ErrorKind::WrongState => tonic::Code::FailedPrecondition,
        ErrorKind::NoMemory | ErrorKind::Internal => tonic::Code::Internal,
    };
    Status::new(code, err.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticBlobInfoProvider(HashMap<String, String>);

    #[async_trait]
    impl BlobInfoProvider for StaticBlobInfoProvider {
        async fn get_blob_urls(&self, digests: &[String]) -> Result<HashMap<String, String>, CmError> {
            Ok(digests.iter().filter_map(|d| self.0.get(d).map(|url| (d.clone(), url.clone()))).collect())
        }
    }

    fn new_controller() -> (SmController, mpsc::UnboundedReceiver<InboundEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (SmController::new(Arc::new(StaticBlobInfoProvider(HashMap::new())), events_tx), events_rx)
    }

    #[tokio::test]
    async fn routing_to_unregistered_node_is_not_found() {
        let (controller, _events) = new_controller();
        let err = controller.get_node_config_status("missing-node").await.unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn get_blobs_infos_delegates_to_the_provider() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let provider = Arc::new(StaticBlobInfoProvider(HashMap::from([("sha256:abc".to_string(), "https://blobs/abc".to_string())])));
        let controller = SmController::new(provider, events_tx);

        let response = controller.get_blobs_infos(Request::new(sm::BlobsInfosRequest { digests: vec!["sha256:abc".into(), "sha256:missing".into()] })).await.unwrap();
        let urls = response.into_inner().urls;
        assert_eq!(urls.get("sha256:abc").map(String::as_str), Some("https://blobs/abc"));
        assert!(!urls.contains_key("sha256:missing"));
    }

    #[tokio::test]
    async fn check_node_config_routes_to_the_registered_session_and_returns_its_response() {
        let (controller, _events) = new_controller();
        let (to_sm, mut to_sm_rx) = mpsc::channel(8);
        let session = Arc::new(SmSession::new(to_sm));
        controller.sessions.lock().await.insert("node-1".to_string(), session.clone());

        let call = tokio::spawn({
            let controller = Arc::new(controller);
            let controller = controller.clone();
            async move { controller.check_node_config("node-1", "v2", "{}").await }
        });

        let sent = to_sm_rx.recv().await.unwrap().unwrap();
        assert!(matches!(sent.payload, Some(sm::sm_incoming_message::Payload::CheckNodeConfig(_))));

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let response_frame = sm::SmOutgoingMessage { payload: Some(sm::sm_outgoing_message::Payload::NodeConfigStatus(sm::NodeConfigStatus { version: "v2".into(), error: String::new() })) };
        session.handle_outgoing_message(response_frame, &events_tx).await;

        let status = call.await.unwrap().unwrap();
        assert_eq!(status.version, "v2");
    }

    #[tokio::test]
    async fn broadcast_cloud_connected_reaches_every_session() {
        let (controller, _events) = new_controller();
        let (to_sm_a, mut rx_a) = mpsc::channel(8);
        let (to_sm_b, mut rx_b) = mpsc::channel(8);
        controller.sessions.lock().await.insert("a".to_string(), Arc::new(SmSession::new(to_sm_a)));
        controller.sessions.lock().await.insert("b".to_string(), Arc::new(SmSession::new(to_sm_b)));

        controller.broadcast_cloud_connected(true).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.recv().await.unwrap().unwrap();
            match frame.payload {
                Some(sm::sm_incoming_message::Payload::ConnectionStatus(status)) => assert!(status.cloud_connected),
                other => panic!("unexpected payload: {other:?}"),
            }
        }
    }
}
