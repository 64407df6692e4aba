//! Message envelope
//!
//! Every message on the wire is a JSON object of the shape
//! `{ type, data, timestamp, id, version?, retry?, metadata? }`. Decoding is
//! deliberately lenient about `timestamp` and `id`: a non-numeric timestamp or
//! a non-string id decodes as "absent", and it is the transform middleware's
//! schema validation that decides whether such a message is dropped.

use core::fmt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ValidationError, WirelinkError};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Protocol version stamped on outgoing messages that carry none
pub const PROTOCOL_VERSION: &str = "1.0";

/// Metadata key set by the compression middleware
pub const META_COMPRESSED: &str = "compressed";
/// Metadata key holding the pre-compression payload size
pub const META_ORIGINAL_SIZE: &str = "originalSize";
/// Metadata key holding the local receive time
pub const META_CLIENT_RECEIVED: &str = "clientReceived";

// ----------------------------------------------------------------------------
// Message Type
// ----------------------------------------------------------------------------

/// Closed set of message kinds understood by the client
///
/// Kinds outside the set decode to [`MessageType::Unknown`] so that schema
/// validation, not the JSON decoder, rejects them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    ConnectionEstablished,
    Heartbeat,
    HeartbeatAck,
    Error,
    System,
    AuthRequired,
    AuthRefresh,
    RateLimited,
    RateLimitCleared,
    WorkflowUpdate,
    DocumentChange,
    LiteratureUpdate,
    PresenceUpdate,
    Notification,
    Unknown(String),
}

impl MessageType {
    /// Wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::ConnectionEstablished => "connection_established",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HeartbeatAck => "heartbeat_ack",
            MessageType::Error => "error",
            MessageType::System => "system",
            MessageType::AuthRequired => "auth_required",
            MessageType::AuthRefresh => "auth_refresh",
            MessageType::RateLimited => "rate_limited",
            MessageType::RateLimitCleared => "rate_limit_cleared",
            MessageType::WorkflowUpdate => "workflow_update",
            MessageType::DocumentChange => "document_change",
            MessageType::LiteratureUpdate => "literature_update",
            MessageType::PresenceUpdate => "presence_update",
            MessageType::Notification => "notification",
            MessageType::Unknown(name) => name,
        }
    }

    /// Whether this kind belongs to the known set
    pub fn is_known(&self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }

    /// Priority bucket used by the batching middleware
    ///
    /// Error and system kinds are high priority, update/change kinds medium,
    /// everything else low. Unknown kinds are classified by name.
    pub fn priority(&self) -> Priority {
        let name = self.as_str();
        if name.contains("error") || name.contains("system") {
            Priority::High
        } else if name.contains("update") || name.contains("change") {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    /// Whether the server sends this kind in reply to a heartbeat
    pub fn is_heartbeat_reply(&self) -> bool {
        matches!(self, MessageType::Heartbeat | MessageType::HeartbeatAck)
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "connection_established" => MessageType::ConnectionEstablished,
            "heartbeat" => MessageType::Heartbeat,
            "heartbeat_ack" => MessageType::HeartbeatAck,
            "error" => MessageType::Error,
            "system" => MessageType::System,
            "auth_required" => MessageType::AuthRequired,
            "auth_refresh" => MessageType::AuthRefresh,
            "rate_limited" => MessageType::RateLimited,
            "rate_limit_cleared" => MessageType::RateLimitCleared,
            "workflow_update" => MessageType::WorkflowUpdate,
            "document_change" => MessageType::DocumentChange,
            "literature_update" => MessageType::LiteratureUpdate,
            "presence_update" => MessageType::PresenceUpdate,
            "notification" => MessageType::Notification,
            _ => MessageType::Unknown(name),
        }
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        MessageType::from(name.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batching priority bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Message Envelope
// ----------------------------------------------------------------------------

/// Wire envelope exchanged with the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Opaque payload; `Some(Value::Null)` is a present `null`
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<Timestamp>,
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create a message with a payload; id and timestamp are assigned later
    pub fn new(kind: impl Into<MessageType>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            timestamp: None,
            id: None,
            version: None,
            retry: None,
            metadata: Map::new(),
        }
    }

    /// Heartbeat probe sent by the connection manager
    pub fn heartbeat(now: Timestamp) -> Self {
        Self::new(MessageType::Heartbeat, Value::Object(Map::new()))
            .with_id(generate_message_id())
            .with_timestamp(now)
    }

    /// Set the message id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the message timestamp
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set a metadata entry
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Decode a raw frame received from the transport
    pub fn decode(raw: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ValidationError::Malformed {
                reason: e.to_string(),
            })?;

        let object = value.as_object().ok_or_else(|| ValidationError::Malformed {
            reason: "expected a JSON object".into(),
        })?;
        if !object.contains_key("type") {
            return Err(ValidationError::MissingField { field: "type" });
        }

        serde_json::from_value(value).map_err(|e| ValidationError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Encode this message for the transport
    pub fn encode(&self) -> Result<String, WirelinkError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Assign id and timestamp if absent, so the envelope invariant holds
    pub fn ensure_envelope(&mut self, now: Timestamp) {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(generate_message_id());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
    }

    /// Identity used by the deduplication middleware
    ///
    /// Returns `None` when the message has no id or timestamp to key on.
    pub fn dedup_key(&self) -> Option<String> {
        let id = self.id.as_deref()?;
        let timestamp = self.timestamp?;
        Some(format!("{}:{}:{}", self.kind, id, timestamp))
    }

    /// Priority bucket of this message's kind
    pub fn priority(&self) -> Priority {
        self.kind.priority()
    }

    /// Serialized size of the payload in bytes
    pub fn payload_size(&self) -> usize {
        self.data
            .as_ref()
            .and_then(|data| serde_json::to_vec(data).ok())
            .map_or(0, |bytes| bytes.len())
    }

    /// Whether a boolean metadata flag is set
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Generate a process-unique message id
pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ----------------------------------------------------------------------------
// Lenient Field Decoders
// ----------------------------------------------------------------------------

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Timestamp::new),
        _ => None,
    })
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(id) => Some(id),
        _ => None,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
