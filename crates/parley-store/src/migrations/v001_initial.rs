//! v001 -- Initial schema creation.
//!
//! Creates the `messages` table. Attachments live on disk and are referenced
//! by name only.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT, -- insertion order tiebreak
    id             TEXT NOT NULL UNIQUE,              -- UUID v4
    sender         TEXT NOT NULL,
    recipient      TEXT NOT NULL,
    text           TEXT,
    attachment_ref TEXT,
    created_at     TEXT NOT NULL,                     -- RFC-3339, UTC, micros

    CHECK (text IS NOT NULL OR attachment_ref IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(sender, recipient, created_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
