//! Async facade over [`Database`] used by the relay.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage};

/// Durable message persistence as seen by the relay.
///
/// `persist_message` is the single source of message ids: callers deliver
/// the returned [`Message`], never a locally built copy.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn persist_message(&self, message: NewMessage) -> Result<Message>;

    /// Both directions of the `(a, b)` conversation, oldest first.
    async fn query_messages(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>>;
}

/// [`MessageStore`] backed by a single SQLite connection. Queries run on
/// tokio's blocking pool so they never stall the async workers.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&*guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn persist_message(&self, message: NewMessage) -> Result<Message> {
        let stored = self.with_db(move |db| db.insert_message(&message)).await?;
        tracing::debug!(
            id = %stored.id,
            sender = %stored.sender,
            recipient = %stored.recipient,
            "persisted message"
        );
        Ok(stored)
    }

    async fn query_messages(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>> {
        let (a, b) = (a.clone(), b.clone());
        self.with_db(move |db| db.get_conversation(&a, &b)).await
    }
}
