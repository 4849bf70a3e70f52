//! JSON wire protocol for the autoupdate websocket.
//!
//! Every frame is a JSON envelope:
//! ```text
//! ┌──────────┬───────────────┬──────────┬─────────────────┐
//! │ type     │ content       │ id       │ in_response?    │
//! │ string   │ type-specific │ string   │ replied-to id   │
//! └──────────┴───────────────┴──────────┴─────────────────┘
//! ```
//!
//! Client to server: `getElements`, `autoupdate`, `listenToProjectors`,
//! `ping`, `notify`. Server to client: `autoupdate`, `projector`,
//! `constants`, `error`, `pong`, `notify`.
//!
//! Schema violations answer with error code 10 and leave the socket open;
//! authorization failures on connect answer with code 100 and close it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::cache::element::{AutoupdatePayload, FullData};

/// Connection attempt by an unauthorized user.
pub const ERROR_NOT_AUTHORIZED: u16 = 100;
/// Client asked for a change id that does not exist yet.
pub const ERROR_CHANGE_ID_TOO_HIGH: u16 = 101;
/// Message failed schema validation.
pub const ERROR_WRONG_FORMAT: u16 = 10;
/// The server could not compute a reply (backend or adapter failure). The
/// failing update is dropped; details stay in the server log.
pub const ERROR_INTERNAL: u16 = 500;

/// Protocol errors. All of them surface to the client as code 10.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Malformed(String),
    UnknownType(String),
    Serialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "Malformed message: {e}"),
            ProtocolError::UnknownType(t) => write!(f, "Unknown message type: {t}"),
            ProtocolError::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Raw client envelope, before per-type validation.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    pub id: String,
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Fetch elements; with a baseline change id this is an incremental
    /// catch-up, without one a full snapshot.
    GetElements { change_id: Option<u64> },
    /// Subscribe to / unsubscribe from autoupdate push.
    Autoupdate(bool),
    /// Subscribe to full-data push for specific projector elements.
    ListenToProjectors { projector_ids: Vec<u64> },
    /// Latency check; the optional value is echoed back in the pong.
    Ping { latency: Option<f64> },
    /// Client-to-client broadcast, relayed verbatim to other connections.
    Notify(Value),
}

impl ClientEnvelope {
    /// Parse a text frame into envelope + validated request.
    pub fn parse(text: &str) -> Result<(ClientEnvelope, ClientRequest), ProtocolError> {
        let envelope: ClientEnvelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let request = envelope.validate()?;
        Ok((envelope, request))
    }

    fn validate(&self) -> Result<ClientRequest, ProtocolError> {
        match self.kind.as_str() {
            "getElements" => {
                let change_id = match &self.content {
                    Value::Null => None,
                    Value::Object(map) => match map.get("change_id") {
                        None | Some(Value::Null) => None,
                        Some(v) => Some(v.as_u64().ok_or_else(|| {
                            ProtocolError::Malformed("change_id must be an unsigned integer".into())
                        })?),
                    },
                    _ => {
                        return Err(ProtocolError::Malformed(
                            "getElements content must be an object".into(),
                        ))
                    }
                };
                Ok(ClientRequest::GetElements { change_id })
            }
            "autoupdate" => match &self.content {
                Value::Bool(on) => Ok(ClientRequest::Autoupdate(*on)),
                _ => Err(ProtocolError::Malformed(
                    "autoupdate content must be a boolean".into(),
                )),
            },
            "listenToProjectors" => {
                let ids = self
                    .content
                    .get("projector_ids")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        ProtocolError::Malformed("projector_ids must be an array".into())
                    })?;
                let mut projector_ids = Vec::with_capacity(ids.len());
                for id in ids {
                    projector_ids.push(id.as_u64().ok_or_else(|| {
                        ProtocolError::Malformed("projector ids must be unsigned integers".into())
                    })?);
                }
                Ok(ClientRequest::ListenToProjectors { projector_ids })
            }
            "ping" => {
                let latency = match &self.content {
                    Value::Null => None,
                    Value::Number(n) => n.as_f64(),
                    Value::Object(map) => match map.get("latency") {
                        None | Some(Value::Null) => None,
                        Some(v) => Some(v.as_f64().ok_or_else(|| {
                            ProtocolError::Malformed("latency must be a number".into())
                        })?),
                    },
                    _ => {
                        return Err(ProtocolError::Malformed(
                            "ping content must be a number or object".into(),
                        ))
                    }
                };
                Ok(ClientRequest::Ping { latency })
            }
            "notify" => match &self.content {
                Value::Object(_) => Ok(ClientRequest::Notify(self.content.clone())),
                _ => Err(ProtocolError::Malformed(
                    "notify content must be an object".into(),
                )),
            },
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// A server-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Autoupdate(AutoupdatePayload),
    Projector {
        change_id: u64,
        data: BTreeMap<u64, FullData>,
    },
    Constants(Value),
    Error {
        code: u16,
        message: String,
    },
    Pong {
        latency: Option<f64>,
    },
    Notify(Value),
}

impl ServerMessage {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Autoupdate(_) => "autoupdate",
            ServerMessage::Projector { .. } => "projector",
            ServerMessage::Constants(_) => "constants",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Notify(_) => "notify",
        }
    }

    fn content(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            ServerMessage::Autoupdate(payload) => serde_json::to_value(payload)
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            ServerMessage::Projector { change_id, data } => json!({
                "change_id": change_id,
                "data": serde_json::to_value(data)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            }),
            ServerMessage::Constants(constants) => constants.clone(),
            ServerMessage::Error { code, message } => json!({
                "code": code,
                "message": message,
            }),
            ServerMessage::Pong { latency } => json!({ "latency": latency }),
            ServerMessage::Notify(content) => content.clone(),
        };
        Ok(value)
    }

    /// Encode as a JSON envelope, optionally replying to a client message.
    pub fn encode(&self, in_response: Option<&str>) -> Result<String, ProtocolError> {
        let mut envelope = json!({
            "type": self.kind(),
            "content": self.content()?,
            "id": Uuid::new_v4().simple().to_string(),
        });
        if let Some(reply_to) = in_response {
            envelope["in_response"] = Value::String(reply_to.to_string());
        }
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Server envelope as decoded by a client (used by tests and tooling).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    pub id: String,
    #[serde(default)]
    pub in_response: Option<String>,
}

impl ServerEnvelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
