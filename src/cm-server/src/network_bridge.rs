//! Dispatches cloud-addressed inbound envelopes that are not themselves
//! correlated responses (spec.md §4.9 "Inbound", step 3: "deliver to the
//! registered handler for messageType"). Acking and response correlation
//! already happen inside [`cm_cloudlink::link::CloudLink`]; what reaches
//! here are the messages that still need CM-side action.
//!
//! Translating a business payload such as `DesiredStatus` into concrete
//! `NetworkManager`/`SmController` operations is delegated to the external
//! update-manager collaborator (SPEC_FULL.md Non-goals); this dispatcher
//! only logs what arrives.

use cm_proto::envelope::{Envelope, MessageData};
use tokio::sync::mpsc;
use tracing::debug;

pub async fn dispatch_inbound(mut inbound: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = inbound.recv().await {
        debug!(message_type = envelope.data.message_type(), "inbound cloud message");
        match envelope.data {
            MessageData::Ack => {}
            other => debug!(message_type = other.message_type(), "no CM-side handler registered for this message type yet"),
        }
    }
}
