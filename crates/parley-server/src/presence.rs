//! Presence broadcasting.
//!
//! Every change to the registry resends the full online set to every live
//! connection, bound or not. Payloads carry only bound identities.

use std::sync::Arc;

use parley_shared::protocol::{PresenceEvent, ServerEvent};
use tracing::{debug, warn};

use crate::registry::{Outbound, Registry};

pub fn snapshot(registry: &Registry) -> PresenceEvent {
    PresenceEvent {
        online: registry.online(),
    }
}

/// Push the current presence set to all live connections. Returns how many
/// connections it was queued for.
pub fn announce(registry: &Registry) -> usize {
    let event = ServerEvent::Presence(snapshot(registry));
    let json: Arc<str> = match event.to_json() {
        Ok(json) => json.into(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize presence event");
            return 0;
        }
    };

    let reached = registry
        .snapshot()
        .into_iter()
        .filter_map(|id| registry.get(id))
        .filter(|conn| conn.send(Outbound::Text(json.clone())))
        .count();

    debug!(
        connections = registry.len(),
        reached,
        online = registry.online().len(),
        "Announced presence"
    );
    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::Identity;
    use tokio::sync::mpsc;

    fn presence_of(frame: Outbound) -> PresenceEvent {
        match frame {
            Outbound::Text(json) => match serde_json::from_str::<ServerEvent>(&json).unwrap() {
                ServerEvent::Presence(p) => p,
                other => panic!("expected presence, got {other:?}"),
            },
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_announce_reaches_unbound_connections() {
        let mut registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.admit(tx_a);
        registry.admit(tx_b);
        registry.bind_identity(a, Identity::new("u1", "alice")).unwrap();

        assert_eq!(announce(&registry), 2);

        let expected = vec![Identity::new("u1", "alice")];
        assert_eq!(presence_of(rx_a.try_recv().unwrap()).online, expected);
        assert_eq!(presence_of(rx_b.try_recv().unwrap()).online, expected);
    }

    #[test]
    fn test_repeat_announce_is_identical() {
        let mut registry = Registry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.admit(tx);
        registry.bind_identity(id, Identity::new("u1", "alice")).unwrap();

        announce(&registry);
        announce(&registry);
        assert_eq!(rx.try_recv().unwrap(), rx.try_recv().unwrap());
    }

    #[test]
    fn test_dead_socket_not_counted() {
        let mut registry = Registry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.admit(tx);
        drop(rx);
        assert_eq!(announce(&registry), 0);
    }
}
