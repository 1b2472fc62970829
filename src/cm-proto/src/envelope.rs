//! The cloud wire envelope (spec.md §3 "Message", §4.1, §6): a `{header, data}`
//! JSON object, `header.createdAt` always RFC-3339 with a trailing `Z`, and a
//! closed set of `data.messageType` variants. Unknown `messageType` values
//! decode to [`MessageData::Unknown`] rather than failing — the inbound
//! pipeline logs and drops those, it never tears down a session over one
//! unrecognized frame (design note in spec.md §9).

use chrono::{DateTime, Utc};
use cm_ore::error::CmError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire version. Both directions must send exactly this value; anything else
/// is logged and the message is dropped (spec.md §6).
pub const SCHEMA_VERSION: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(rename = "version")]
    pub schema_version: u32,
    pub system_id: String,
    #[serde(with = "created_at_format")]
    pub created_at: DateTime<Utc>,
    pub txn: Uuid,
}

impl Header {
    pub fn new(system_id: impl Into<String>) -> Self {
        Header { schema_version: SCHEMA_VERSION, system_id: system_id.into(), created_at: cm_ore::time::now(), txn: Uuid::new_v4() }
    }
}

/// `createdAt` on the wire is always millisecond-precision RFC-3339 with a
/// trailing `Z` (spec.md §3), not chrono's default auto-precision
/// serialization.
mod created_at_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&cm_ore::time::to_rfc3339(*t))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        cm_ore::time::from_rfc3339(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub data: MessageData,
}

impl Envelope {
    pub fn new(system_id: impl Into<String>, data: MessageData) -> Self {
        Envelope { header: Header::new(system_id), data }
    }

    /// Re-sends reuse the original `txn` and `createdAt` (spec.md §3
    /// "Unacked outgoing message": duplicate suppression on the peer is by
    /// `txn`, so a retry must not mint a new one).
    pub fn retry_clone(&self) -> Self {
        self.clone()
    }

    pub fn encode(&self) -> Result<String, CmError> {
        serde_json::to_string(self).map_err(|e| CmError::bad_message(e.to_string()))
    }

    pub fn decode(bytes: &str) -> Result<Self, CmError> {
        serde_json::from_str(bytes).map_err(|e| CmError::bad_message(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatedItem {
    pub correlation_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum MessageData {
    Alerts { correlation_id: String, #[serde(default)] items: Vec<serde_json::Value> },
    MonitoringData { node_id: String, #[serde(default)] payload: serde_json::Value },
    PushLog { correlation_id: String, part: String, part_count: u64, #[serde(default)] data: String, #[serde(default)] error: String },
    NewState { #[serde(default)] state: serde_json::Value },
    StateRequest { #[serde(default)] version: Option<String> },
    OverrideEnvVarsStatus { correlation_id: String, #[serde(default)] statuses: Vec<serde_json::Value> },
    RequestBlobUrls { correlation_id: String, digests: Vec<String> },
    BlobUrls { correlation_id: String, #[serde(default)] items: Vec<serde_json::Value> },
    Ack,
    IssueUnitCertificates { #[serde(default)] requests: Vec<serde_json::Value> },
    InstallUnitCertificatesConfirmation { #[serde(default)] certificates: Vec<serde_json::Value> },
    RenewCertificatesNotification { #[serde(default)] certificates: Vec<serde_json::Value> },
    IssuedUnitCertificates { #[serde(default)] certificates: Vec<serde_json::Value> },
    UpdateState { #[serde(default)] state: serde_json::Value },
    StateAcceptance { #[serde(default)] error: String },
    RequestLog { correlation_id: String, #[serde(default)] instance_filter: Option<String>, #[serde(default)] from: Option<String>, #[serde(default)] till: Option<String> },
    DesiredStatus { #[serde(default)] instances: Vec<serde_json::Value>, #[serde(default)] services: Vec<serde_json::Value> },
    /// Not part of the closed set. Kept so a forward-compatible peer never
    /// tears down a session for sending a message type we don't know yet.
    #[serde(other)]
    Unknown,
}

impl MessageData {
    /// Every message type except `ack` itself demands a peer ack
    /// (spec.md §6, §4.9 "Outbound").
    pub fn requires_ack(&self) -> bool {
        !matches!(self, MessageData::Ack)
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            MessageData::Alerts { .. } => "alerts",
            MessageData::MonitoringData { .. } => "monitoringData",
            MessageData::PushLog { .. } => "pushLog",
            MessageData::NewState { .. } => "newState",
            MessageData::StateRequest { .. } => "stateRequest",
            MessageData::OverrideEnvVarsStatus { .. } => "overrideEnvVarsStatus",
            MessageData::RequestBlobUrls { .. } => "requestBlobUrls",
            MessageData::BlobUrls { .. } => "blobUrls",
            MessageData::Ack => "ack",
            MessageData::IssueUnitCertificates { .. } => "issueUnitCertificates",
            MessageData::InstallUnitCertificatesConfirmation { .. } => "installUnitCertificatesConfirmation",
            MessageData::RenewCertificatesNotification { .. } => "renewCertificatesNotification",
            MessageData::IssuedUnitCertificates { .. } => "issuedUnitCertificates",
            MessageData::UpdateState { .. } => "updateState",
            MessageData::StateAcceptance { .. } => "stateAcceptance",
            MessageData::RequestLog { .. } => "requestLog",
            MessageData::DesiredStatus { .. } => "desiredStatus",
            MessageData::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_well_formed_envelope() {
        // `createdAt` truncates to millisecond precision on the wire (spec.md
        // §3), so round-tripping an envelope minted with `Header::new` isn't
        // exact unless the clock happens to land on a millisecond boundary.
        let mut env = Envelope::new("system-1", MessageData::RequestBlobUrls { correlation_id: "2a05".into(), digests: vec!["sha256:3c3a".into()] });
        env.header.created_at = cm_ore::time::from_rfc3339(&cm_ore::time::to_rfc3339(env.header.created_at)).unwrap();
        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn created_at_has_a_trailing_z() {
        let env = Envelope::new("system-1", MessageData::Ack);
        let encoded = env.encode().unwrap();
        let v: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let created_at = v["header"]["createdAt"].as_str().unwrap();
        assert!(created_at.ends_with('Z'));
    }

    #[test]
    fn created_at_is_millisecond_precision() {
        let env = Envelope::new("system-1", MessageData::Ack);
        let encoded = env.encode().unwrap();
        let v: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let created_at = v["header"]["createdAt"].as_str().unwrap();
        assert_eq!(created_at, cm_ore::time::to_rfc3339(env.header.created_at));
    }

    #[test]
    fn unknown_message_type_decodes_instead_of_erroring() {
        let raw = r#"{"header":{"version":7,"systemId":"s","createdAt":"2024-01-01T00:00:00Z","txn":"00000000-0000-0000-0000-000000000000"},"data":{"messageType":"somethingNew","foo":"bar"}}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.data, MessageData::Unknown);
    }

    #[test]
    fn missing_required_field_is_bad_message() {
        let raw = r#"{"header":{"version":7,"systemId":"s","createdAt":"2024-01-01T00:00:00Z","txn":"00000000-0000-0000-0000-000000000000"},"data":{"messageType":"requestBlobUrls"}}"#;
        let err = Envelope::decode(raw).unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::BadMessage);
    }

    #[test]
    fn ack_does_not_require_another_ack() {
        assert!(!MessageData::Ack.requires_ack());
        assert!(MessageData::RequestBlobUrls { correlation_id: "x".into(), digests: vec![] }.requires_ack());
    }
}
