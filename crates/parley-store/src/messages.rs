use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parley_shared::UserId;
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage};

impl Database {
    /// Append a message, assigning its id and creation time.
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        if !new.has_content() {
            return Err(StoreError::EmptyMessage);
        }

        let message = Message {
            id: Uuid::new_v4(),
            sender: new.sender.clone(),
            recipient: new.recipient.clone(),
            text: new.text.clone().filter(|t| !t.is_empty()),
            attachment_ref: new.attachment_ref.clone().filter(|a| !a.is_empty()),
            // Truncated to the precision the column keeps.
            created_at: Utc::now().trunc_subsecs(6),
        };

        self.conn().execute(
            "INSERT INTO messages (id, sender, recipient, text, attachment_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.sender.as_str(),
                message.recipient.as_str(),
                message.text,
                message.attachment_ref,
                format_timestamp(&message.created_at),
            ],
        )?;

        Ok(message)
    }

    /// Every message exchanged between `a` and `b`, in either direction,
    /// oldest first.
    pub fn get_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sender, recipient, text, attachment_ref, created_at
             FROM messages
             WHERE (sender = ?1 AND recipient = ?2)
                OR (sender = ?2 AND recipient = ?1)
             ORDER BY created_at ASC, seq ASC",
        )?;

        let rows = stmt.query_map(params![a.as_str(), b.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_messages(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// Fixed-width UTC so lexical order in SQLite matches chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let recipient: String = row.get(2)?;
    let text: Option<String> = row.get(3)?;
    let attachment_ref: Option<String> = row.get(4)?;
    let ts_str: String = row.get(5)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id,
        sender: UserId(sender),
        recipient: UserId(recipient),
        text,
        attachment_ref,
        created_at,
    })
}
