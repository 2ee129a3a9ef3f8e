//! JSON message shapes exchanged over the relay socket.
//!
//! Clients send an [`InboundMessage`] naming a recipient. The relay stamps it
//! with the sender's verified identity, producing an [`Envelope`], and
//! delivers an [`OutboundMessage`] to the recipient. The recipient field is
//! never echoed back out.

use crate::types::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding or encoding socket payloads.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The payload was not valid JSON for the expected shape.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client → relay payload.
///
/// Clients may include a `sender` field; it has no counterpart here and is
/// discarded while decoding, so a client can never choose its own sender.
/// Absent fields decode as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InboundMessage {
    /// Identity the message should be delivered to.
    #[serde(default)]
    pub recipient: Identity,
    /// Message text.
    #[serde(rename = "message", default)]
    pub body: String,
}

impl InboundMessage {
    /// Decode an inbound payload from raw socket bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Json`] if the bytes are not a JSON object, or
    /// if `recipient` or `message` is present with a non-string value.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Attach the verified sender identity.
    #[must_use]
    pub fn stamp(self, sender: Identity) -> Envelope {
        Envelope {
            sender,
            recipient: self.recipient,
            body: self.body,
        }
    }
}

/// Relay → recipient payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OutboundMessage {
    /// Verified identity of the sending connection.
    pub sender: Identity,
    /// Message text.
    #[serde(rename = "message")]
    pub body: String,
}

impl OutboundMessage {
    /// Encode as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an outbound payload, as a client would.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Json`] on malformed input.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A message in flight inside the relay, sender already stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Verified identity of the sending connection.
    pub sender: Identity,
    /// Identity the message is addressed to.
    pub recipient: Identity,
    /// Message text.
    pub body: String,
}

impl Envelope {
    /// The payload written to the recipient. Drops the recipient field.
    #[must_use]
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            sender: self.sender.clone(),
            body: self.body.clone(),
        }
    }
}
