//! # parley-shared
//!
//! Types shared by the Parley relay server and its storage layer: user
//! identities, the JSON wire protocol spoken over the WebSocket, and the
//! protocol-level error type.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{Identity, UserId};
