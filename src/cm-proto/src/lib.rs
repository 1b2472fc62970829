//! Wire types shared by the cloud link and the SM controller: the cloud JSON
//! envelope codec (C1) and the generated `SmService` gRPC contract.

pub mod envelope;

pub use envelope::{CorrelatedItem, Envelope, Header, MessageData, SCHEMA_VERSION};

/// Generated from `proto/sm.proto` by `build.rs`.
pub mod sm {
    tonic::include_proto!("cm.sm.v1");
}
