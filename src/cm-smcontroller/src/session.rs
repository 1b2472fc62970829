//! One bidirectional gRPC stream to a single SM node (spec.md §4.5), ported
//! from `smhandler.hpp`/`smhandler.cpp`: a reader task demuxes inbound
//! frames, a writer side (the tonic response channel) serializes outbound
//! frames, and requests that expect a response register a waiter resolved
//! by the reader when a matching response arrives. The SM protocol itself
//! carries no `txn`, so (mirroring `SyncMessageSender`'s single `Message`
//! slot) at most one request of a given response kind may be outstanding at
//! a time per session.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use cm_ore::error::CmError;
use cm_proto::sm;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio_stream::StreamExt;
use tonic::Streaming;
use tracing::{debug, trace, warn};

/// `smhandler.hpp`'s `cResponseTime`.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The subset of outgoing-message kinds that are correlated responses to a
/// request this side sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    NodeConfigStatus,
    AverageMonitoring,
}

fn response_kind_of(msg: &sm::sm_outgoing_message::Payload) -> Option<ResponseKind> {
    match msg {
        sm::sm_outgoing_message::Payload::NodeConfigStatus(_) => Some(ResponseKind::NodeConfigStatus),
        sm::sm_outgoing_message::Payload::AverageMonitoring(_) => Some(ResponseKind::AverageMonitoring),
        _ => None,
    }
}

/// Inbound frames not consumed as a correlated response, forwarded to the
/// upstream fanout collaborator (spec.md §4.11).
#[derive(Debug, Clone)]
pub enum InboundEvent {
    NodeConnected { node_id: String },
    NodeDisconnected { node_id: String },
    UpdateInstancesStatus { node_id: String, status: sm::UpdateInstancesStatus },
    NodeInstancesStatus(sm::NodeInstancesStatus),
    Log { node_id: String, log: sm::LogData },
    InstantMonitoring(sm::InstantMonitoring),
    Alert(sm::Alert),
}

/// A live session with one SM node.
pub struct SmSession {
    node_id: RwLock<Option<String>>,
    node_id_ready: Notify,
    to_sm: mpsc::Sender<Result<sm::SmIncomingMessage, tonic::Status>>,
    pending: StdMutex<HashMap<ResponseKind, oneshot::Sender<sm::SmOutgoingMessage>>>,
    response_timeout: Duration,
}

impl SmSession {
    pub fn new(to_sm: mpsc::Sender<Result<sm::SmIncomingMessage, tonic::Status>>) -> Self {
        SmSession { node_id: RwLock::new(None), node_id_ready: Notify::new(), to_sm, pending: StdMutex::new(HashMap::new()), response_timeout: DEFAULT_RESPONSE_TIMEOUT }
    }

    pub async fn node_id(&self) -> Option<String> {
        self.node_id.read().await.clone()
    }

    /// Resolves as soon as [`Self::dispatch`] has handled the SM's first
    /// `NodeInfo` frame, replacing a fixed-attempt poll loop: `notify_one`
    /// keeps a permit even if no one is waiting yet, so this cannot miss a
    /// `NodeInfo` that arrives between the initial check and the wait.
    pub async fn wait_for_node_id(&self) -> String {
        loop {
            if let Some(node_id) = self.node_id().await {
                return node_id;
            }
            self.node_id_ready.notified().await;
        }
    }

    /// Sends a frame that does not await a response (`UpdateInstances`,
    /// `UpdateNetworks`, `RequestLog`, the cloud connection-status push).
    pub async fn send(&self, payload: sm::sm_incoming_message::Payload) -> Result<(), CmError> {
        self.to_sm.send(Ok(sm::SmIncomingMessage { payload: Some(payload) })).await.map_err(|_| CmError::unavailable("SM session writer closed"))
    }

    /// Sends a frame and awaits the correlated response, bounded by
    /// `responseTimeout` (default 5s). Only one request of `kind` may be
    /// outstanding at a time; a second call while one is pending replaces
    /// the waiter, matching the original's single `Message` slot.
    pub async fn request(&self, payload: sm::sm_incoming_message::Payload, kind: ResponseKind) -> Result<sm::SmOutgoingMessage, CmError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(kind, tx);

        if let Err(e) = self.send(payload).await {
            self.pending.lock().unwrap().remove(&kind);
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CmError::unavailable("SM session closed while awaiting response")),
            Err(_) => {
                self.pending.lock().unwrap().remove(&kind);
                Err(CmError::timeout(format!("no {kind:?} response within {:?}", self.response_timeout)))
            }
        }
    }

    /// Demuxes `stream` until it ends or the session is stopped, resolving
    /// pending requests and forwarding everything else as an [`InboundEvent`].
    pub async fn run_reader(&self, mut stream: Streaming<sm::SmOutgoingMessage>, events: mpsc::UnboundedSender<InboundEvent>) {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "SM session stream error");
                    break;
                }
            };
            self.handle_outgoing_message(frame, &events).await;
        }

        if let Some(node_id) = self.node_id().await {
            let _ = events.send(InboundEvent::NodeDisconnected { node_id });
        }
    }

    /// Handles one frame received from the SM: resolves a matching pending
    /// request, or else demuxes it into an [`InboundEvent`]. Split out of
    /// [`Self::run_reader`] so it is testable without a live gRPC stream.
    pub async fn handle_outgoing_message(&self, frame: sm::SmOutgoingMessage, events: &mpsc::UnboundedSender<InboundEvent>) {
        let Some(payload) = frame.payload else {
            trace!("SM session received empty frame");
            return;
        };

        if let Some(kind) = response_kind_of(&payload) {
            if let Some(waiter) = self.pending.lock().unwrap().remove(&kind) {
                let _ = waiter.send(sm::SmOutgoingMessage { payload: Some(payload) });
                return;
            }
        }

        self.dispatch(payload, events).await;
    }

    async fn dispatch(&self, payload: sm::sm_outgoing_message::Payload, events: &mpsc::UnboundedSender<InboundEvent>) {
        use sm::sm_outgoing_message::Payload;

        match payload {
            Payload::NodeInfo(info) => {
                debug!(node_id = %info.node_id, "SM node registered");
                *self.node_id.write().await = Some(info.node_id.clone());
                self.node_id_ready.notify_one();
                let _ = events.send(InboundEvent::NodeConnected { node_id: info.node_id });
            }
            Payload::UpdateInstancesStatus(status) => {
                if let Some(node_id) = self.node_id().await {
                    let _ = events.send(InboundEvent::UpdateInstancesStatus { node_id, status });
                }
            }
            Payload::NodeInstancesStatus(status) => {
                let _ = events.send(InboundEvent::NodeInstancesStatus(status));
            }
            Payload::Log(log) => {
                if let Some(node_id) = self.node_id().await {
                    let _ = events.send(InboundEvent::Log { node_id, log });
                }
            }
            Payload::InstantMonitoring(monitoring) => {
                let _ = events.send(InboundEvent::InstantMonitoring(monitoring));
            }
            Payload::Alert(alert) => {
                let _ = events.send(InboundEvent::Alert(alert));
            }
            Payload::NodeConfigStatus(_) | Payload::AverageMonitoring(_) => {
                warn!("dropping unrequested SM response frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> (SmSession, mpsc::Receiver<Result<sm::SmIncomingMessage, tonic::Status>>) {
        let (tx, rx) = mpsc::channel(8);
        (SmSession::new(tx), rx)
    }

    #[tokio::test]
    async fn fire_and_forget_send_does_not_block() {
        let (session, mut rx) = new_session();
        session.send(sm::sm_incoming_message::Payload::RequestLog(sm::RequestLog { correlation_id: "id".into(), ..Default::default() })).await.unwrap();
        let frame = rx.recv().await.unwrap().unwrap();
        assert!(matches!(frame.payload, Some(sm::sm_incoming_message::Payload::RequestLog(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_when_no_response_arrives() {
        let (session, mut rx) = new_session();
        let request = tokio::spawn(async move { session.request(sm::sm_incoming_message::Payload::GetNodeConfigStatus(sm::GetNodeConfigStatus {}), ResponseKind::NodeConfigStatus).await });
        rx.recv().await.unwrap().unwrap();

        tokio::time::advance(DEFAULT_RESPONSE_TIMEOUT + Duration::from_millis(1)).await;
        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn request_resolves_when_matching_response_arrives() {
        let (session, mut to_sm_rx) = new_session();
        let session = std::sync::Arc::new(session);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let request = tokio::spawn({
            let session = session.clone();
            async move { session.request(sm::sm_incoming_message::Payload::GetNodeConfigStatus(sm::GetNodeConfigStatus {}), ResponseKind::NodeConfigStatus).await }
        });
        to_sm_rx.recv().await.unwrap().unwrap();

        let response_frame = sm::SmOutgoingMessage { payload: Some(sm::sm_outgoing_message::Payload::NodeConfigStatus(sm::NodeConfigStatus { version: "v1".into(), error: String::new() })) };
        session.handle_outgoing_message(response_frame, &events_tx).await;

        let response = request.await.unwrap().unwrap();
        match response.payload {
            Some(sm::sm_outgoing_message::Payload::NodeConfigStatus(status)) => assert_eq!(status.version, "v1"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn node_info_sets_node_id_and_emits_connected_event() {
        let (session, to_sm_rx) = new_session();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let frame = sm::SmOutgoingMessage { payload: Some(sm::sm_outgoing_message::Payload::NodeInfo(sm::NodeInfo { node_id: "node-1".into() })) };
        session.handle_outgoing_message(frame, &events_tx).await;

        assert_eq!(session.node_id().await.as_deref(), Some("node-1"));
        match events_rx.recv().await.unwrap() {
            InboundEvent::NodeConnected { node_id } => assert_eq!(node_id, "node-1"),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(to_sm_rx);
        let _ = &session;
    }

    #[tokio::test]
    async fn wait_for_node_id_resolves_once_node_info_arrives() {
        let (session, _to_sm_rx) = new_session();
        let session = std::sync::Arc::new(session);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.wait_for_node_id().await }
        });
        tokio::task::yield_now().await;

        let frame = sm::SmOutgoingMessage { payload: Some(sm::sm_outgoing_message::Payload::NodeInfo(sm::NodeInfo { node_id: "node-9".into() })) };
        session.handle_outgoing_message(frame, &events_tx).await;

        assert_eq!(waiter.await.unwrap(), "node-9");
    }

    #[tokio::test]
    async fn unrequested_response_frame_is_dropped_not_delivered() {
        let (session, _to_sm_rx) = new_session();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let frame = sm::SmOutgoingMessage { payload: Some(sm::sm_outgoing_message::Payload::AverageMonitoring(sm::AverageMonitoring::default())) };
        session.handle_outgoing_message(frame, &events_tx).await;

        assert!(events_rx.try_recv().is_err());
    }
}
