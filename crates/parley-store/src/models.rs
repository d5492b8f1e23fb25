//! Domain model structs persisted in the message database.

use chrono::{DateTime, Utc};
use parley_shared::UserId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message as stored. `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender: UserId,
    pub recipient: UserId,
    pub text: Option<String>,
    /// Reference returned by the attachment store, if a file was sent.
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: UserId,
    pub recipient: UserId,
    pub text: Option<String>,
    pub attachment_ref: Option<String>,
}

impl NewMessage {
    pub fn has_content(&self) -> bool {
        let text = self.text.as_deref().is_some_and(|t| !t.is_empty());
        let attachment = self.attachment_ref.as_deref().is_some_and(|a| !a.is_empty());
        text || attachment
    }
}
