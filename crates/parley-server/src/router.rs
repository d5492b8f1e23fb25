//! Chat envelope routing.
//!
//! The hub validates each inbound envelope against the sending connection
//! ([`accept`]) and queues it on that connection's [`Pipeline`]. The
//! pipeline is a single worker task per connection that writes the
//! attachment and the message in FIFO order, then hands the persisted
//! [`Message`] back to the hub, which fans it out with [`deliver`]. A slow
//! write therefore only delays its own connection, and a message is never
//! delivered before it is durable.
//!
//! Nothing between the socket and the store drops a valid envelope. Each
//! frame carries a [`Charge`] against its connection's [`InboundBudget`],
//! taken by the socket task before the frame reaches the hub and released
//! once the write is done. A connection that outpaces the store stops being
//! read until earlier writes finish.

use std::sync::Arc;

use parley_shared::protocol::{ChatEnvelope, DeliveryEvent, RoutableEnvelope, ServerEvent};
use parley_shared::UserId;
use parley_store::{Message, MessageStore, NewMessage};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::attachments::AttachmentStore;
use crate::error::RelayError;
use crate::hub::HubEvent;
use crate::registry::{Connection, ConnectionId, Outbound, Registry};

/// Smallest charge for one frame, in bytes. Bounds how many tiny envelopes
/// a connection may have in flight.
pub const MIN_FRAME_COST: usize = 1024;

/// The persistence collaborators.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub attachments: Arc<dyn AttachmentStore>,
}

/// Bytes of inbound frames a connection may have queued or being written.
#[derive(Debug, Clone)]
pub struct InboundBudget {
    permits: Arc<Semaphore>,
    capacity: u32,
}

/// A frame's hold on its connection's budget. Released on drop.
#[derive(Debug)]
pub struct Charge {
    _permit: OwnedSemaphorePermit,
}

impl InboundBudget {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_FRAME_COST, u32::MAX as usize) as u32;
        Self {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Wait until a frame of `len` bytes fits. A frame larger than the whole
    /// budget waits for everything else to drain.
    pub async fn acquire(&self, len: usize) -> Result<Charge, RelayError> {
        let cost = len
            .max(MIN_FRAME_COST)
            .min(self.capacity as usize) as u32;
        self.permits
            .clone()
            .acquire_many_owned(cost)
            .await
            .map(|permit| Charge { _permit: permit })
            .map_err(|_| RelayError::TransportFailure("inbound budget closed".to_string()))
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[derive(Debug)]
pub struct PersistJob {
    pub sender: UserId,
    pub envelope: RoutableEnvelope,
    pub charge: Option<Charge>,
}

/// Check that `conn` may send and that `raw` is a routable envelope. The
/// sender is always the connection's bound identity.
pub fn accept(conn: &Connection, raw: &str) -> Result<PersistJob, RelayError> {
    let sender = conn
        .user_id()
        .cloned()
        .ok_or(RelayError::AuthenticationMissing)?;
    let envelope = ChatEnvelope::parse(raw)?.validate()?;
    Ok(PersistJob {
        sender,
        envelope,
        charge: None,
    })
}

/// Handle to a connection's persistence worker. Dropping it lets the worker
/// finish what is queued and exit; writes in flight are never cancelled.
#[derive(Debug)]
pub struct Pipeline {
    jobs: mpsc::UnboundedSender<PersistJob>,
}

impl Pipeline {
    pub fn spawn(id: ConnectionId, stores: Stores, events: mpsc::UnboundedSender<HubEvent>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<PersistJob>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match persist(job, &stores).await {
                    Ok(message) => {
                        if events.send(HubEvent::Persisted(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(conn = %id, error = %e, "Dropping envelope");
                    }
                }
            }
            debug!(conn = %id, "Persistence pipeline finished");
        });

        Self { jobs }
    }

    pub fn submit(&self, job: PersistJob) -> Result<(), RelayError> {
        self.jobs
            .send(job)
            .map_err(|_| RelayError::TransportFailure("persistence pipeline closed".to_string()))
    }
}

/// Store the attachment (if any), then the message. An attachment whose
/// message fails to persist is removed again.
pub async fn persist(job: PersistJob, stores: &Stores) -> Result<Message, RelayError> {
    // Held until the write completes.
    let PersistJob {
        sender,
        envelope,
        charge: _charge,
    } = job;

    let attachment_ref = match &envelope.file {
        Some(file) => {
            let bytes = file.decode()?;
            let name = stores
                .attachments
                .persist_attachment(&file.extension(), &bytes)
                .await?;
            debug!(name = %name, size = bytes.len(), "Saved attachment");
            Some(name)
        }
        None => None,
    };

    let stored = stores
        .messages
        .persist_message(NewMessage {
            sender,
            recipient: envelope.recipient,
            text: envelope.text,
            attachment_ref: attachment_ref.clone(),
        })
        .await;

    match stored {
        Ok(message) => Ok(message),
        Err(e) => {
            if let Some(name) = attachment_ref {
                if let Err(cleanup) = stores.attachments.remove_attachment(&name).await {
                    warn!(name = %name, error = %cleanup, "Failed to remove orphaned attachment");
                }
            }
            Err(e.into())
        }
    }
}

/// Send `message` to every live connection bound to its recipient. Returns
/// the number of connections reached.
pub fn deliver(registry: &Registry, message: &Message) -> usize {
    let event = ServerEvent::Delivery(DeliveryEvent {
        text: message.text.clone(),
        sender: message.sender.clone(),
        recipient: message.recipient.clone(),
        attachment_ref: message.attachment_ref.clone(),
        id: message.id,
    });
    let json: Arc<str> = match event.to_json() {
        Ok(json) => json.into(),
        Err(e) => {
            warn!(id = %message.id, error = %e, "Failed to serialize delivery event");
            return 0;
        }
    };

    let reached = registry
        .recipients(&message.recipient)
        .filter(|conn| {
            let queued = conn.send(Outbound::Text(json.clone()));
            if !queued {
                debug!(conn = %conn.id(), id = %message.id, "Recipient socket already gone");
            }
            queued
        })
        .count();

    debug!(
        id = %message.id,
        sender = %message.sender,
        recipient = %message.recipient,
        reached,
        "Delivered message"
    );
    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::DiskAttachmentStore;
    use async_trait::async_trait;
    use parley_shared::Identity;
    use parley_store::{Database, SqliteMessageStore, StoreError};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn stores() -> (Stores, TempDir) {
        let dir = TempDir::new().unwrap();
        let attachments = DiskAttachmentStore::new(dir.path().join("uploads"), 1024)
            .await
            .unwrap();
        let messages = SqliteMessageStore::new(Database::open_in_memory().unwrap());
        (
            Stores {
                messages: Arc::new(messages),
                attachments: Arc::new(attachments),
            },
            dir,
        )
    }

    fn job(raw: &str) -> PersistJob {
        PersistJob {
            sender: "u1".into(),
            envelope: ChatEnvelope::parse(raw).unwrap().validate().unwrap(),
            charge: None,
        }
    }

    #[test]
    fn test_accept_requires_bound_sender() {
        let mut registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.admit(tx);

        let raw = r#"{"recipient":"u2","text":"hi"}"#;
        assert!(matches!(
            accept(registry.get(id).unwrap(), raw),
            Err(RelayError::AuthenticationMissing)
        ));

        registry.bind_identity(id, Identity::new("u1", "alice")).unwrap();
        let job = accept(registry.get(id).unwrap(), raw).unwrap();
        assert_eq!(job.sender, UserId::new("u1"));
    }

    #[test]
    fn test_accept_ignores_client_supplied_sender() {
        let mut registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.admit(tx);
        registry.bind_identity(id, Identity::new("u1", "alice")).unwrap();

        let raw = r#"{"recipient":"u2","text":"hi","sender":"u9"}"#;
        let job = accept(registry.get(id).unwrap(), raw).unwrap();
        assert_eq!(job.sender, UserId::new("u1"));
    }

    #[test]
    fn test_accept_rejects_malformed() {
        let mut registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.admit(tx);
        registry.bind_identity(id, Identity::new("u1", "alice")).unwrap();
        let conn = registry.get(id).unwrap();

        for raw in ["{", r#"{"text":"hi"}"#, r#"{"recipient":"u2"}"#] {
            assert!(matches!(
                accept(conn, raw),
                Err(RelayError::MalformedEnvelope(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_persist_with_attachment() {
        let (stores, _dir) = stores().await;
        let message = persist(
            job(r#"{"recipient":"u2","file":{"name":"a.txt","data":"data:text/plain;base64,aGk="}}"#),
            &stores,
        )
        .await
        .unwrap();

        let name = message.attachment_ref.clone().unwrap();
        assert!(name.ends_with(".txt"));
        assert_eq!(stores.attachments.read_attachment(&name).await.unwrap(), b"hi");
        assert!(message.text.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_attachment_persists_nothing() {
        let (stores, _dir) = stores().await;
        let err = persist(
            job(r#"{"recipient":"u2","text":"see file","file":{"name":"a.png","data":"data:image/png;base64,%%%"}}"#),
            &stores,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RelayError::AttachmentDecodeFailure(_)));
        let convo = stores
            .messages
            .query_messages(&"u1".into(), &"u2".into())
            .await
            .unwrap();
        assert!(convo.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_attachment_is_persistence_failure() {
        let (stores, _dir) = stores().await;
        let big = "A".repeat(4096);
        let raw = format!(r#"{{"recipient":"u2","file":{{"name":"big.bin","data":"{big}"}}}}"#);
        let err = persist(job(&raw), &stores).await.unwrap_err();
        assert!(matches!(err, RelayError::PersistenceFailure(_)));
    }

    struct RejectingStore;

    #[async_trait]
    impl MessageStore for RejectingStore {
        async fn persist_message(&self, _new: NewMessage) -> parley_store::Result<Message> {
            Err(StoreError::Task("disk full".to_string()))
        }

        async fn query_messages(
            &self,
            _a: &UserId,
            _b: &UserId,
        ) -> parley_store::Result<Vec<Message>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_message_write_removes_attachment() {
        let dir = TempDir::new().unwrap();
        let uploads = dir.path().join("uploads");
        let stores = Stores {
            messages: Arc::new(RejectingStore),
            attachments: Arc::new(DiskAttachmentStore::new(uploads.clone(), 1024).await.unwrap()),
        };

        let err = persist(
            job(r#"{"recipient":"u2","file":{"name":"a.txt","data":"aGk="}}"#),
            &stores,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RelayError::PersistenceFailure(_)));
        assert_eq!(std::fs::read_dir(&uploads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_charge_held_until_write_completes() {
        let (stores, _dir) = stores().await;
        let budget = InboundBudget::new(4 * MIN_FRAME_COST);

        let mut job = job(r#"{"recipient":"u2","text":"hi"}"#);
        job.charge = Some(budget.acquire(10).await.unwrap());
        assert_eq!(budget.available(), 3 * MIN_FRAME_COST);

        persist(job, &stores).await.unwrap();
        assert_eq!(budget.available(), 4 * MIN_FRAME_COST);
    }

    #[tokio::test]
    async fn test_budget_blocks_when_exhausted() {
        let budget = InboundBudget::new(2 * MIN_FRAME_COST);
        let first = budget.acquire(MIN_FRAME_COST).await.unwrap();
        let _second = budget.acquire(1).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), budget.acquire(1)).await;
        assert!(waiting.is_err());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), budget.acquire(1))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_takes_whole_budget() {
        let budget = InboundBudget::new(2 * MIN_FRAME_COST);
        let charge = budget.acquire(10 * MIN_FRAME_COST).await.unwrap();
        assert_eq!(budget.available(), 0);
        drop(charge);
        assert_eq!(budget.available(), 2 * MIN_FRAME_COST);
    }

    #[test]
    fn test_deliver_fans_out_to_every_device() {
        let mut registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        let a = registry.admit(tx_a);
        let b = registry.admit(tx_b);
        let c = registry.admit(tx_c);
        registry.bind_identity(a, Identity::new("u1", "alice")).unwrap();
        registry.bind_identity(b, Identity::new("u1", "alice")).unwrap();
        registry.bind_identity(c, Identity::new("u2", "bob")).unwrap();

        let message = Message {
            id: uuid::Uuid::new_v4(),
            sender: "u2".into(),
            recipient: "u1".into(),
            text: Some("yo".into()),
            attachment_ref: None,
            created_at: chrono::Utc::now(),
        };

        assert_eq!(deliver(&registry, &message), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }
}
