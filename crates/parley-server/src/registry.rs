//! Table of live connections.
//!
//! The registry is owned by the hub task and only ever touched from it, so
//! it needs no locking. Connections are keyed by a monotonically increasing
//! [`ConnectionId`]; iteration is in admission order.

use std::collections::BTreeMap;
use std::sync::Arc;

use parley_shared::{Identity, UserId};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::heartbeat::Heartbeat;
use crate::router::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued for a connection's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A serialized server event, shared between all recipients of a broadcast.
    Text(Arc<str>),
    /// Heartbeat probe.
    Ping,
    /// Close the transport and stop.
    Close,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("connection {0} is not registered")]
    Unknown(ConnectionId),

    #[error("connection {0} already has an identity")]
    AlreadyBound(ConnectionId),
}

pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    identity: Option<Identity>,
    pub(crate) heartbeat: Heartbeat,
    pub(crate) pipeline: Option<Pipeline>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.identity.as_ref().map(|i| &i.user_id)
    }

    /// Queue a frame. Returns `false` if the socket task is gone.
    pub fn send(&self, frame: Outbound) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

#[derive(Default)]
pub struct Registry {
    next_id: u64,
    connections: BTreeMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, outbound: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(
            id,
            Connection {
                id,
                outbound,
                identity: None,
                heartbeat: Heartbeat::default(),
                pipeline: None,
            },
        );
        id
    }

    /// Set the identity of `id`. Identities are immutable once bound.
    pub fn bind_identity(&mut self, id: ConnectionId, identity: Identity) -> Result<(), BindError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(BindError::Unknown(id))?;
        if conn.identity.is_some() {
            return Err(BindError::AlreadyBound(id));
        }
        conn.identity = Some(identity);
        Ok(())
    }

    /// Remove `id`. Only the first call for a given id returns the
    /// connection; callers announce presence only in that case.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Ids of every live connection, in admission order.
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Identities of bound connections, in admission order. Unbound
    /// connections are left out; multiple devices of one user each appear.
    pub fn online(&self) -> Vec<Identity> {
        self.connections
            .values()
            .filter_map(|c| c.identity().cloned())
            .collect()
    }

    /// Live connections bound to `user_id`.
    pub fn recipients<'a>(&'a self, user_id: &'a UserId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .values()
            .filter(move |c| c.user_id() == Some(user_id))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
