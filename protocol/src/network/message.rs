//! # Wire Messages
//!
//! Every frame on a peer connection is one JSON object:
//!
//! ```json
//! {"type": "NEW_TRIAD", "payload": {"triad": {...}, "ttl": 8}}
//! ```
//!
//! Frames are parsed independently. Decoding goes through [`RawMessage`]
//! first so that a frame with an unrecognized `type` can be told apart from
//! a frame that is not a message at all.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::GOSSIP_TTL;
use crate::matrix::{MatrixSnapshot, Triad};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Faults in peer messages. Reported back to the sender as `ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not JSON, not an object, or a payload that does not fit its type.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Handshake from a peer on another logical network.
    #[error("network mismatch: expected {expected}, got {actual}")]
    NetworkMismatch { expected: String, actual: String },
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub node_id: String,
    pub network_id: String,
    /// Address the sender can be dialed at, if it knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTriad {
    pub triad: Triad,
    /// Remaining hops. Older senders omit it.
    #[serde(default = "default_ttl")]
    pub ttl: u8,
}

fn default_ttl() -> u8 {
    GOSSIP_TTL
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateTriad {
    pub id: String,
    pub validator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A peer-to-peer message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Handshake(Handshake),
    Discovery(Discovery),
    Peers(PeerList),
    NewTriad(NewTriad),
    ValidateTriad(ValidateTriad),
    TriadValidated(Triad),
    GetStatus,
    StatusUpdate(MatrixSnapshot),
    Error(ErrorPayload),
}

/// Envelope used for the first decoding pass.
#[derive(Debug, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

fn payload<T: for<'de> Deserialize<'de>>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::Malformed(format!("invalid {kind} payload: {e}")))
}

impl Message {
    /// Builds an `ERROR` message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Wire name of this message's type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "HANDSHAKE",
            Self::Discovery(_) => "DISCOVERY",
            Self::Peers(_) => "PEERS",
            Self::NewTriad(_) => "NEW_TRIAD",
            Self::ValidateTriad(_) => "VALIDATE_TRIAD",
            Self::TriadValidated(_) => "TRIAD_VALIDATED",
            Self::GetStatus => "GET_STATUS",
            Self::StatusUpdate(_) => "STATUS_UPDATE",
            Self::Error(_) => "ERROR",
        }
    }

    /// Serializes to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parses a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = raw.kind.as_str();

        let message = match kind {
            "HANDSHAKE" => Self::Handshake(payload(kind, raw.payload)?),
            "DISCOVERY" => Self::Discovery(payload(kind, raw.payload)?),
            "PEERS" => Self::Peers(payload(kind, raw.payload)?),
            "NEW_TRIAD" => Self::NewTriad(payload(kind, raw.payload)?),
            "VALIDATE_TRIAD" => Self::ValidateTriad(payload(kind, raw.payload)?),
            "TRIAD_VALIDATED" => Self::TriadValidated(payload(kind, raw.payload)?),
            // Payload ignored.
            "GET_STATUS" => Self::GetStatus,
            "STATUS_UPDATE" => Self::StatusUpdate(payload(kind, raw.payload)?),
            "ERROR" => Self::Error(payload(kind, raw.payload)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(message)
    }
}
