//! Wire protocol for the tunnel channel.
//!
//! One envelope is one WebSocket text frame carrying a JSON object with the
//! keys `correlationId`, `type`, `timestamp` and `payload`. The `type` field
//! selects the payload shape; a mismatch rejects the whole frame.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Correlation key minted by the server for each forwarded request and echoed
/// verbatim by the client on its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Generate a fresh v4 id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope discriminator, `type` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    Request,
    Response,
    Error,
    Control,
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeType::Request => write!(f, "REQUEST"),
            EnvelopeType::Response => write!(f, "RESPONSE"),
            EnvelopeType::Error => write!(f, "ERROR"),
            EnvelopeType::Control => write!(f, "CONTROL"),
        }
    }
}

/// An HTTP request travelling server -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    /// Uppercase HTTP verb.
    pub method: String,
    /// Origin-form path, always starting with `/`.
    pub path: String,
    /// Raw query pairs in original order, `None` when the URI has no query.
    #[serde(default)]
    pub query: Option<Vec<(String, String)>>,
    /// Header map with multi-valued headers pre-joined by `", "`.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes, base64 on the wire, `None` when the request had none.
    #[serde(default, with = "body_base64")]
    pub body: Option<Vec<u8>>,
    /// Set when the public request asked for a WebSocket upgrade.
    #[serde(default)]
    pub websocket_upgrade: bool,
}

/// An HTTP response travelling client -> server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "body_base64")]
    pub body: Option<Vec<u8>>,
}

/// A tunnel-level failure for a specific correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Channel management actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    Register,
    Registered,
    Unregister,
    Heartbeat,
    Ping,
    Pong,
    Disconnect,
}

/// Reason attached to CONTROL/DISCONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    NewConnection,
    Shutdown,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DisconnectReason>,
}

/// Type-discriminated payload. Adjacent tagging produces the
/// `{"type": ..., "payload": ...}` pair on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    #[serde(rename = "REQUEST")]
    Request(RequestPayload),
    #[serde(rename = "RESPONSE")]
    Response(ResponsePayload),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
    #[serde(rename = "CONTROL")]
    Control(ControlPayload),
}

impl Payload {
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            Payload::Request(_) => EnvelopeType::Request,
            Payload::Response(_) => EnvelopeType::Response,
            Payload::Error(_) => EnvelopeType::Error,
            Payload::Control(_) => EnvelopeType::Control,
        }
    }
}

/// One framed message on the tunnel channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "correlationId")]
    pub correlation_id: CorrelationId,
    #[serde(with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Frame decoding failures. `UnknownType` is answered with
/// ERROR/INVALID_REQUEST; everything else drops the frame locally.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing `{0}` field")]
    MissingField(&'static str),
    #[error("unknown envelope type `{0}`")]
    UnknownType(String),
    #[error("payload does not match envelope type {kind}: {source}")]
    PayloadShape {
        kind: EnvelopeType,
        source: serde_json::Error,
    },
}

impl Envelope {
    fn new(correlation_id: CorrelationId, payload: Payload) -> Self {
        Self {
            correlation_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Build a REQUEST envelope with a caller-supplied correlation id.
    pub fn request(correlation_id: CorrelationId, payload: RequestPayload) -> Self {
        Self::new(correlation_id, Payload::Request(payload))
    }

    /// Build a RESPONSE envelope echoing the request's correlation id.
    pub fn response(correlation_id: CorrelationId, payload: ResponsePayload) -> Self {
        Self::new(correlation_id, Payload::Response(payload))
    }

    /// Build an ERROR envelope for the given correlation id.
    pub fn error(correlation_id: CorrelationId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            correlation_id,
            Payload::Error(ErrorPayload {
                code,
                message: message.into(),
            }),
        )
    }

    fn control(payload: ControlPayload) -> Self {
        Self::new(CorrelationId::new(), Payload::Control(payload))
    }

    /// CONTROL/REGISTER, optionally asking for a specific subdomain.
    pub fn register(subdomain: Option<String>) -> Self {
        Self::control(ControlPayload {
            action: ControlAction::Register,
            subdomain,
            public_url: None,
            reason: None,
        })
    }

    /// CONTROL/REGISTERED announcing the assigned subdomain and public URL.
    pub fn registered(subdomain: String, public_url: String) -> Self {
        Self::control(ControlPayload {
            action: ControlAction::Registered,
            subdomain: Some(subdomain),
            public_url: Some(public_url),
            reason: None,
        })
    }

    /// CONTROL/UNREGISTER ending the session from the client side.
    pub fn unregister() -> Self {
        Self::control(ControlPayload {
            action: ControlAction::Unregister,
            subdomain: None,
            public_url: None,
            reason: None,
        })
    }

    pub fn ping() -> Self {
        Self::control(ControlPayload {
            action: ControlAction::Ping,
            subdomain: None,
            public_url: None,
            reason: None,
        })
    }

    /// CONTROL/PONG answering a PING, echoing its correlation id.
    pub fn pong(correlation_id: CorrelationId) -> Self {
        Self::new(
            correlation_id,
            Payload::Control(ControlPayload {
                action: ControlAction::Pong,
                subdomain: None,
                public_url: None,
                reason: None,
            }),
        )
    }

    pub fn disconnect(reason: DisconnectReason) -> Self {
        Self::control(ControlPayload {
            action: ControlAction::Disconnect,
            subdomain: None,
            public_url: None,
            reason: Some(reason),
        })
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a text frame, distinguishing unknown envelope types (which get
    /// an ERROR reply) from locally dropped malformed frames.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(DecodeError::MissingField("type"))?;
        let kind = match kind {
            "REQUEST" => EnvelopeType::Request,
            "RESPONSE" => EnvelopeType::Response,
            "ERROR" => EnvelopeType::Error,
            "CONTROL" => EnvelopeType::Control,
            other => return Err(DecodeError::UnknownType(other.to_string())),
        };
        serde_json::from_value(value).map_err(|source| DecodeError::PayloadShape { kind, source })
    }
}

/// RFC 3339 timestamps with millisecond precision, as emitted by the sender.
/// Correlation never reads them; they exist for operators and logs.
mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Base64 body transport. `None` serializes to JSON null; the empty string is
/// a valid encoding of an empty body.
mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD
                .decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
