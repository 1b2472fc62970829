//! Upstream fanout (spec.md §4.11): wraps SM-session-observed alerts,
//! monitoring, logs and instance statuses into the matching outgoing
//! variant and pushes them onto the cloud link's outbound queue. Ordering
//! is per-source (FIFO within one SM session); no ordering across sessions.

use cm_proto::envelope::MessageData;
use cm_smcontroller::session::InboundEvent;
use serde_json::json;
use tokio::sync::mpsc;

use crate::link::CloudLink;

fn to_message_data(event: InboundEvent) -> Option<MessageData> {
    match event {
        InboundEvent::NodeConnected { .. } | InboundEvent::NodeDisconnected { .. } => None,
        InboundEvent::Alert(alert) => Some(MessageData::Alerts {
            correlation_id: alert.tag.clone(),
            items: vec![json!({"tag": alert.tag, "nodeId": alert.node_id, "payload": alert.payload})],
        }),
        InboundEvent::InstantMonitoring(monitoring) => Some(MessageData::MonitoringData { node_id: monitoring.node_id, payload: json!(monitoring.data) }),
InboundEvent::Log { node_id: _, log } => Some(MessageData::PushLog {
            correlation_id: log.correlation_id,
            part: log.part,
            part_count: log.part_count,
            data: String::from_utf8_lossy(&log.data).into_owned(),
            error: log.error,
        }),
        InboundEvent::UpdateInstancesStatus { node_id, status } => {
            let instances: Vec<_> = status.instances.iter().map(|s| json!({"ident": format!("{:?}", s.ident), "state": s.state, "error": s.error})).collect();
            Some(MessageData::NewState { state: json!({"nodeId": node_id, "instances": instances}) })
        }
        InboundEvent::NodeInstancesStatus(status) => {
            let instances: Vec<_> = status.instances.iter().map(|s| json!({"ident": format!("{:?}", s.ident), "state": s.state, "error": s.error})).collect();
            Some(MessageData::NewState { state: json!({"nodeId": status.node_id, "instances": instances}) })
        }
    }
}

/// Drains SM-session events and pushes the corresponding cloud message onto
/// `link`'s outbound queue, non-blocking (spec §5 "non-critical producers
/// drop oldest" — see [`CloudLink::try_send`] for the exact policy).
pub async fn run(mut events: mpsc::UnboundedReceiver<InboundEvent>, link: std::sync::Arc<CloudLink>) {
    while let Some(event) = events.recv().await {
        if let Some(data) = to_message_data(event) {
            link.try_send(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_connection_events_are_not_forwarded() {
        assert!(to_message_data(InboundEvent::NodeConnected { node_id: "n".into() }).is_none());
        assert!(to_message_data(InboundEvent::NodeDisconnected { node_id: "n".into() }).is_none());
    }

    #[test]
    fn alert_becomes_an_alerts_message() {
        let alert = cm_proto::sm::Alert { tag: "oom".into(), node_id: "n0".into(), payload: "killed".into() };
        let data = to_message_data(InboundEvent::Alert(alert)).unwrap();
        match data {
            MessageData::Alerts { correlation_id, items } => {
                assert_eq!(correlation_id, "oom");
                assert_eq!(items.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
