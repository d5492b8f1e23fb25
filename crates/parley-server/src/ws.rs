//! WebSocket transport.
//!
//! Each upgraded socket gets one task that shuttles frames between the
//! client and the hub. The task never inspects envelopes; it only forwards
//! text frames and pongs inward and writes whatever the hub queues outward.
//! While a text frame waits for inbound budget the socket is not read, but
//! outbound frames keep flowing.

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use parley_shared::Identity;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::auth::session_token;
use crate::hub::HubHandle;
use crate::registry::Outbound;
use crate::router::InboundBudget;

/// Headroom over the decoded attachment limit for base64 and the JSON
/// envelope around it.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws`. The upgrade always succeeds; a missing or bad session only
/// means the connection stays unbound.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let identity = session_token(&headers, query.token).and_then(|t| state.verifier.verify(&t));
    let max_message = state.config.max_attachment_size / 3 * 4 + ENVELOPE_OVERHEAD;
    let hub = state.hub.clone();

    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| {
            handle_socket(socket, hub, identity, InboundBudget::new(max_message))
        })
}

async fn handle_socket(
    socket: WebSocket,
    hub: HubHandle,
    identity: Option<Identity>,
    budget: InboundBudget,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let id = match hub.open(out_tx, identity).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Could not register connection");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    // Read but not yet forwarded.
    let mut pending: Option<String> = None;

    let reason = loop {
        let pending_len = pending.as_ref().map_or(0, String::len);

        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(Outbound::Text(json)) => {
                    if sink.send(WsMessage::Text(json.as_ref().into())).await.is_err() {
                        break "write error";
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break "write error";
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break "evicted";
                }
            },
            charge = budget.acquire(pending_len), if pending.is_some() => match charge {
                Ok(charge) => {
                    if let Some(text) = pending.take() {
                        hub.inbound(id, text, charge);
                    }
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "Inbound budget unavailable");
                    break "budget closed";
                }
            },
            incoming = stream.next(), if pending.is_none() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    pending = Some(text.as_str().to_owned());
                }
                Some(Ok(WsMessage::Pong(_))) => hub.pong(id),
                Some(Ok(WsMessage::Binary(data))) => {
                    debug!(conn = %id, len = data.len(), "Ignoring binary frame");
                }
                // Pings are answered by the protocol layer.
                Some(Ok(WsMessage::Ping(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => break "client closed",
                Some(Err(e)) => {
                    debug!(conn = %id, error = %e, "WebSocket read failed");
                    break "read error";
                }
            },
        }
    };

    hub.closed(id, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use parley_shared::protocol::ServerEvent;
    use parley_store::{Database, SqliteMessageStore};
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::api::serve_on;
    use crate::attachments::DiskAttachmentStore;
    use crate::auth::{issue_token, JwtVerifier};
    use crate::config::ServerConfig;
    use crate::heartbeat::HeartbeatConfig;
    use crate::hub::{Hub, HubStats};
    use crate::router::Stores;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const SECRET: &str = "ws-test-secret";

    const QUIET: HeartbeatConfig = HeartbeatConfig {
        interval: Duration::from_secs(3600),
        timeout: Duration::from_secs(3600),
    };

    struct Server {
        addr: SocketAddr,
        hub: HubHandle,
        _dir: TempDir,
    }

    async fn server(heartbeat: HeartbeatConfig) -> Server {
        let dir = TempDir::new().unwrap();
        let messages = Arc::new(SqliteMessageStore::new(Database::open_in_memory().unwrap()));
        let attachments = Arc::new(
            DiskAttachmentStore::new(dir.path().join("uploads"), 1024)
                .await
                .unwrap(),
        );
        let config = ServerConfig {
            jwt_secret: SECRET.to_string(),
            heartbeat,
            ..ServerConfig::default()
        };
        let hub = Hub::spawn(
            Stores {
                messages: messages.clone(),
                attachments: attachments.clone(),
            },
            heartbeat,
        );
        let state = AppState {
            hub: hub.clone(),
            messages,
            attachments,
            verifier: Arc::new(JwtVerifier::new(SECRET)),
            config: Arc::new(config),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, state));

        Server {
            addr,
            hub,
            _dir: dir,
        }
    }

    async fn connect_with_cookie(addr: SocketAddr, user_id: &str, username: &str) -> Client {
        let token = issue_token(SECRET, user_id, username, None);
        let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
        request.headers_mut().insert(
            "cookie",
            HeaderValue::from_str(&format!("theme=dark; token={token}")).unwrap(),
        );
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }

    async fn connect_with_query(addr: SocketAddr, token: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .unwrap();
        ws
    }

    fn alice() -> Identity {
        Identity::new("u1", "alice")
    }

    fn bob() -> Identity {
        Identity::new("u2", "bob")
    }

    /// Read until `pick` accepts a server event, answering pings on the way.
    async fn read_until<T>(ws: &mut Client, pick: impl Fn(ServerEvent) -> Option<T>) -> T {
        timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await.expect("socket closed").unwrap() {
                    ClientMessage::Text(text) => {
                        let event = serde_json::from_str::<ServerEvent>(text.as_str()).unwrap();
                        if let Some(found) = pick(event) {
                            return found;
                        }
                    }
                    ClientMessage::Ping(payload) => {
                        ws.send(ClientMessage::Pong(payload)).await.unwrap();
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("expected event never arrived")
    }

    async fn presence_equals(ws: &mut Client, expected: Vec<Identity>) {
        read_until(ws, |event| match event {
            ServerEvent::Presence(p) if p.online == expected => Some(()),
            _ => None,
        })
        .await
    }

    async fn stats_until(hub: &HubHandle, pred: impl Fn(HubStats) -> bool) -> HubStats {
        timeout(Duration::from_secs(5), async {
            loop {
                let stats = hub.stats().await.unwrap();
                if pred(stats) {
                    return stats;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("hub never reached expected state")
    }

    #[tokio::test]
    async fn test_cookie_session_binds() {
        let server = server(QUIET).await;
        let mut ws = connect_with_cookie(server.addr, "u1", "alice").await;

        presence_equals(&mut ws, vec![alice()]).await;
        let stats = server.hub.stats().await.unwrap();
        assert_eq!(stats.online, 1);
    }

    #[tokio::test]
    async fn test_query_token_binds() {
        let server = server(QUIET).await;
        let token = issue_token(SECRET, "u2", "bob", None);
        let mut ws = connect_with_query(server.addr, &token).await;

        presence_equals(&mut ws, vec![bob()]).await;
    }

    #[tokio::test]
    async fn test_bad_token_still_upgrades_unbound() {
        let server = server(QUIET).await;
        let mut ws = connect_with_query(server.addr, "not.a.jwt").await;

        presence_equals(&mut ws, vec![]).await;
        let stats = stats_until(&server.hub, |s| s.connections == 1).await;
        assert_eq!(stats.online, 0);
    }

    #[tokio::test]
    async fn test_text_frame_is_routed() {
        let server = server(QUIET).await;
        let mut a = connect_with_cookie(server.addr, "u1", "alice").await;
        presence_equals(&mut a, vec![alice()]).await;
        let mut b = connect_with_cookie(server.addr, "u2", "bob").await;
        presence_equals(&mut b, vec![alice(), bob()]).await;

        a.send(ClientMessage::Text(r#"{"recipient":"u2","text":"hi"}"#.into()))
            .await
            .unwrap();

        let delivered = read_until(&mut b, |event| match event {
            ServerEvent::Delivery(d) => Some(d),
            _ => None,
        })
        .await;
        assert_eq!(delivered.text.as_deref(), Some("hi"));
        assert_eq!(delivered.sender.as_str(), "u1");
    }

    #[tokio::test]
    async fn test_ping_answered_keeps_connection() {
        let config = HeartbeatConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(200),
        };
        let server = server(config).await;
        let mut ws = connect_with_cookie(server.addr, "u1", "alice").await;

        let mut pings = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, ws.next()).await {
            if let ClientMessage::Ping(payload) = frame.unwrap() {
                pings += 1;
                ws.send(ClientMessage::Pong(payload)).await.unwrap();
            }
        }

        assert!(pings >= 3, "only {pings} pings");
        let stats = server.hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test]
    async fn test_unanswered_pings_evict() {
        let config = HeartbeatConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(250),
        };
        let server = server(config).await;
        let mut watcher = connect_with_cookie(server.addr, "u2", "bob").await;
        presence_equals(&mut watcher, vec![bob()]).await;

        // Never polled, so its pings go unanswered.
        let _silent = connect_with_cookie(server.addr, "u1", "alice").await;
        presence_equals(&mut watcher, vec![bob(), alice()]).await;
        presence_equals(&mut watcher, vec![bob()]).await;

        stats_until(&server.hub, |s| s.connections == 1).await;
    }

    #[tokio::test]
    async fn test_client_close_evicts_and_reannounces() {
        let server = server(QUIET).await;
        let mut a = connect_with_cookie(server.addr, "u1", "alice").await;
        presence_equals(&mut a, vec![alice()]).await;
        let mut b = connect_with_cookie(server.addr, "u2", "bob").await;
        presence_equals(&mut b, vec![alice(), bob()]).await;

        a.close(None).await.unwrap();

        presence_equals(&mut b, vec![bob()]).await;
        stats_until(&server.hub, |s| s.connections == 1).await;
    }

    #[tokio::test]
    async fn test_dropped_transport_evicts() {
        let server = server(QUIET).await;
        let mut a = connect_with_cookie(server.addr, "u1", "alice").await;
        presence_equals(&mut a, vec![alice()]).await;
        let mut b = connect_with_cookie(server.addr, "u2", "bob").await;
        presence_equals(&mut b, vec![alice(), bob()]).await;

        drop(a);

        presence_equals(&mut b, vec![bob()]).await;
    }
}
