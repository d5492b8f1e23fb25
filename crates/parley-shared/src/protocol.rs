//! JSON wire protocol spoken over the relay WebSocket.
//!
//! Clients send [`ChatEnvelope`]s; the server pushes [`ServerEvent`]s.
//! Liveness uses WebSocket ping/pong control frames and has no JSON form.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{FALLBACK_EXTENSION, MAX_EXTENSION_LEN};
use crate::error::ProtocolError;
use crate::types::{Identity, UserId};

/// One inbound chat payload from a client connection.
///
/// Every field is optional on the wire so that malformed envelopes can be
/// parsed and then rejected by [`ChatEnvelope::validate`] instead of failing
/// deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FilePayload>,
}

/// An inline file upload: original name plus base64 content, optionally
/// wrapped in a `data:<mime>;base64,` URL as browsers produce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    pub name: String,
    pub data: String,
}

/// An envelope that passed validation and can be persisted.
#[derive(Debug, Clone)]
pub struct RoutableEnvelope {
    pub recipient: UserId,
    pub text: Option<String>,
    pub file: Option<FilePayload>,
}

impl ChatEnvelope {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Require a non-empty recipient and at least one of text / file.
    /// Empty text counts as absent.
    pub fn validate(self) -> Result<RoutableEnvelope, ProtocolError> {
        let recipient = match self.recipient {
            Some(r) if !r.is_empty() => r,
            _ => return Err(ProtocolError::MissingRecipient),
        };
        let text = self.text.filter(|t| !t.is_empty());
        if text.is_none() && self.file.is_none() {
            return Err(ProtocolError::EmptyEnvelope);
        }
        Ok(RoutableEnvelope {
            recipient,
            text,
            file: self.file,
        })
    }
}

impl FilePayload {
    /// Decode the base64 content, stripping a data-URL prefix if present.
    pub fn decode(&self) -> Result<Vec<u8>, ProtocolError> {
        let encoded = match self.data.split_once(',') {
            Some((_, body)) => body,
            None => self.data.as_str(),
        };
        Ok(STANDARD.decode(encoded.trim())?)
    }

    /// Lower-cased extension of the original file name, restricted to ASCII
    /// alphanumerics so it is always safe to embed in a storage name.
    pub fn extension(&self) -> String {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_EXTENSION_LEN
                    && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
    }
}

/// Events pushed from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEvent {
    Presence(PresenceEvent),
    Delivery(DeliveryEvent),
}

/// Full set of identity-bound live connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub online: Vec<Identity>,
}

/// A persisted message handed to a recipient connection. `id` is the
/// store-assigned message id, so clients can dedupe optimistic copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub sender: UserId,
    pub recipient: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    pub id: Uuid,
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
