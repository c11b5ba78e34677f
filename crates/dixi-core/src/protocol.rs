//! Viewer socket protocol
//!
//! Every server → client frame is a JSON text message:
//!
//!   { "type": "ai_response", "data": { "text": "...", "metadata": { ... } } }
//!
//! Client → server frames use the same envelope. The hub only acknowledges
//! them:
//!
//!   { "type": "ack", "data": { "type": "<original type>" } }

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Outbound channel names recognised by viewers.
pub mod channel {
    pub const CONNECTED: &str = "connected";
    pub const GESTURE: &str = "gesture";
    pub const AI_RESPONSE: &str = "ai_response";
    pub const TRACKING: &str = "tracking";
    pub const ACK: &str = "ack";
}

/// `{type, data}` message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Borrowing twin of [`Envelope`] so payloads serialize without an
/// intermediate `Value`.
#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: Serialize + ?Sized> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Serialize `{type: channel, data: payload}` straight to a JSON string.
    pub fn encode<T: Serialize + ?Sized>(channel: &str, payload: &T) -> Result<String> {
        Ok(serde_json::to_string(&OutgoingEnvelope {
            kind: channel,
            data: payload,
        })?)
    }

    /// Parse an inbound frame. Anything that is not an object with a
    /// non-empty string `type` is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| Error::malformed(e.to_string()))?;
        if envelope.kind.trim().is_empty() {
            return Err(Error::malformed("empty message type"));
        }
        Ok(envelope)
    }

    /// Connection acknowledgement, sent once on register.
    pub fn connected(client_id: &str) -> Self {
        Self::new(
            channel::CONNECTED,
            serde_json::json!({
                "clientId": client_id,
                "message": "Connected to Dixi",
            }),
        )
    }

    /// Acknowledgement echoing the type of an inbound message.
    pub fn ack(original_type: &str) -> Self {
        Self::new(channel::ACK, serde_json::json!({ "type": original_type }))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
