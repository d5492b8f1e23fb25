//! # parley-store
//!
//! Durable message storage for the Parley relay, backed by SQLite.
//!
//! [`Database`] is a synchronous handle wrapping a `rusqlite::Connection`
//! with typed helpers. [`SqliteMessageStore`] puts it behind the async
//! [`MessageStore`] trait the relay consumes, running every query on the
//! blocking thread pool.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use store::{MessageStore, SqliteMessageStore};
