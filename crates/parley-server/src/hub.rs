//! The relay hub.
//!
//! One task owns the [`Registry`] and applies every state change: opens,
//! closes, inbound envelopes, heartbeat ticks and expiries, and completed
//! persistence jobs all arrive as [`HubEvent`]s on a single queue. Socket
//! tasks, timers and persistence workers never touch the registry directly.

use parley_shared::Identity;
use parley_store::Message;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::heartbeat::HeartbeatConfig;
use crate::presence;
use crate::registry::{ConnectionId, Outbound, Registry};
use crate::router::{self, Charge, Pipeline, Stores};

#[derive(Debug)]
pub enum HubEvent {
    /// A transport was accepted. `identity` is the verified session, if any.
    Open {
        outbound: mpsc::UnboundedSender<Outbound>,
        identity: Option<Identity>,
        reply: oneshot::Sender<ConnectionId>,
    },
    /// A text frame from the client, holding its share of the
    /// connection's inbound budget.
    Inbound {
        id: ConnectionId,
        text: String,
        charge: Charge,
    },
    Pong(ConnectionId),
    /// The transport closed or failed.
    Closed { id: ConnectionId, reason: &'static str },
    ProbeDue(ConnectionId),
    ProbeExpired { id: ConnectionId, probe: u64 },
    /// A message is durable and may be delivered.
    Persisted(Message),
    Stats(oneshot::Sender<HubStats>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub online: usize,
}

pub struct Hub {
    registry: Registry,
    stores: Stores,
    heartbeat: HeartbeatConfig,
    events_tx: mpsc::UnboundedSender<HubEvent>,
    events_rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl Hub {
    pub fn new(stores: Stores, heartbeat: HeartbeatConfig) -> (Self, HubHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = HubHandle {
            events: events_tx.clone(),
        };
        let hub = Self {
            registry: Registry::new(),
            stores,
            heartbeat,
            events_tx,
            events_rx,
        };
        (hub, handle)
    }

    /// Start the hub on its own task.
    pub fn spawn(stores: Stores, heartbeat: HeartbeatConfig) -> HubHandle {
        let (hub, handle) = Self::new(stores, heartbeat);
        tokio::spawn(hub.run());
        handle
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.heartbeat.interval.as_millis() as u64,
            timeout_ms = self.heartbeat.timeout.as_millis() as u64,
            "Relay hub started"
        );
        while let Some(event) = self.events_rx.recv().await {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Open {
                outbound,
                identity,
                reply,
            } => self.on_open(outbound, identity, reply),
            HubEvent::Inbound { id, text, charge } => self.on_inbound(id, &text, charge),
            HubEvent::Pong(id) => {
                if let Some(conn) = self.registry.get_mut(id) {
                    conn.heartbeat.on_pong();
                }
            }
            HubEvent::Closed { id, reason } => self.evict(id, reason),
            HubEvent::ProbeDue(id) => self.on_probe_due(id),
            HubEvent::ProbeExpired { id, probe } => {
                let Some(conn) = self.registry.get_mut(id) else {
                    return;
                };
                if conn.heartbeat.on_expired(probe) {
                    debug!(
                        conn = %id,
                        probe,
                        last_pong_ms = conn.heartbeat.last_pong().map(|t| t.elapsed().as_millis() as u64),
                        "Probe unanswered"
                    );
                    self.evict(id, "heartbeat timeout");
                }
            }
            HubEvent::Persisted(message) => {
                router::deliver(&self.registry, &message);
            }
            HubEvent::Stats(reply) => {
                let _ = reply.send(HubStats {
                    connections: self.registry.len(),
                    online: self.registry.online().len(),
                });
            }
        }
    }

    fn on_open(
        &mut self,
        outbound: mpsc::UnboundedSender<Outbound>,
        identity: Option<Identity>,
        reply: oneshot::Sender<ConnectionId>,
    ) {
        let id = self.registry.admit(outbound);
        if let Some(conn) = self.registry.get_mut(id) {
            conn.heartbeat
                .start(id, self.heartbeat, self.events_tx.clone());
        }
        if reply.send(id).is_err() {
            // Socket task went away before it learned its id.
            self.evict(id, "abandoned");
            return;
        }
        info!(conn = %id, "Connection opened");
        presence::announce(&self.registry);

        let Some(identity) = identity else {
            debug!(conn = %id, "Connection has no session; staying unbound");
            return;
        };
        let user_id = identity.user_id.clone();
        if let Err(e) = self.registry.bind_identity(id, identity) {
            warn!(conn = %id, error = %e, "Failed to bind identity");
            return;
        }
        let pipeline = Pipeline::spawn(id, self.stores.clone(), self.events_tx.clone());
        if let Some(conn) = self.registry.get_mut(id) {
            conn.pipeline = Some(pipeline);
        }
        info!(conn = %id, user = %user_id, "Identity bound");
        presence::announce(&self.registry);
    }

    fn on_inbound(&mut self, id: ConnectionId, text: &str, charge: Charge) {
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        let result = router::accept(conn, text).and_then(|mut job| match &conn.pipeline {
            Some(pipeline) => {
                job.charge = Some(charge);
                pipeline.submit(job)
            }
            None => Err(RelayError::AuthenticationMissing),
        });
        match result {
            Ok(()) => {}
            Err(RelayError::AuthenticationMissing) => {
                debug!(conn = %id, "Dropping envelope from unbound connection");
            }
            Err(e @ RelayError::MalformedEnvelope(_)) => {
                debug!(conn = %id, error = %e, "Dropping envelope");
            }
            Err(e) => {
                warn!(conn = %id, error = %e, "Dropping envelope");
            }
        }
    }

    fn on_probe_due(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let Some(probe) = conn.heartbeat.begin_probe() else {
            return;
        };
        if !conn.send(Outbound::Ping) {
            debug!(conn = %id, "Ping not queued; socket task gone");
        }
        conn.heartbeat
            .arm_timeout(id, probe, self.heartbeat, self.events_tx.clone());
    }

    /// Remove `id` and tell everyone. Later calls for the same id do nothing.
    fn evict(&mut self, id: ConnectionId, reason: &str) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        conn.heartbeat.stop();
        conn.send(Outbound::Close);
        info!(
            conn = %id,
            user = conn.user_id().map(|u| u.as_str()).unwrap_or("-"),
            reason,
            "Connection closed"
        );
        drop(conn);
        presence::announce(&self.registry);
    }
}

/// Cloneable sender side of the hub.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
}

impl HubHandle {
    /// Register a transport and return its id once the hub has admitted it.
    pub async fn open(
        &self,
        outbound: mpsc::UnboundedSender<Outbound>,
        identity: Option<Identity>,
    ) -> Result<ConnectionId, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(HubEvent::Open {
                outbound,
                identity,
                reply,
            })
            .map_err(|_| RelayError::TransportFailure("hub stopped".to_string()))?;
        rx.await
            .map_err(|_| RelayError::TransportFailure("hub stopped".to_string()))
    }

    /// Forward a text frame. `charge` is released once the frame has been
    /// dropped or written.
    pub fn inbound(&self, id: ConnectionId, text: String, charge: Charge) {
        let _ = self.events.send(HubEvent::Inbound { id, text, charge });
    }

    pub fn pong(&self, id: ConnectionId) {
        let _ = self.events.send(HubEvent::Pong(id));
    }

    pub fn closed(&self, id: ConnectionId, reason: &'static str) {
        let _ = self.events.send(HubEvent::Closed { id, reason });
    }

    /// Current counts. Also a barrier: every event sent before this call
    /// has been handled when it returns.
    pub async fn stats(&self) -> Option<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.events.send(HubEvent::Stats(reply)).ok()?;
        rx.await.ok()
    }
}
