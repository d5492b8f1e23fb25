use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parley_shared::UserId;
use parley_store::{Message, MessageStore};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::attachments::AttachmentStore;
use crate::auth::{session_token, SessionVerifier};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::HubHandle;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub messages: Arc<dyn MessageStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub verifier: Arc<dyn SessionVerifier>,
    pub config: Arc<ServerConfig>,
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origin = match config.cors_origin.as_deref() {
        Some(origin) => match HeaderValue::from_str(origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                warn!(origin, "Invalid CORS_ORIGIN, mirroring request origin");
                AllowOrigin::mirror_request()
            }
        },
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/messages/{peer}", get(conversation))
        .route("/uploads/{name}", get(attachment_download))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    online: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.stats().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: stats.map(|s| s.connections),
        online: stats.map(|s| s.online),
    })
}

/// History between the session's user and `peer`, oldest first.
async fn conversation(
    State(state): State<AppState>,
    Path(peer): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, ServerError> {
    let identity = session_token(&headers, query.token)
        .and_then(|t| state.verifier.verify(&t))
        .ok_or(ServerError::Unauthorized)?;

    let peer = UserId::new(peer);
    if peer.is_empty() {
        return Err(ServerError::BadRequest("Empty peer id".to_string()));
    }

    let messages = state
        .messages
        .query_messages(&identity.user_id, &peer)
        .await?;
    Ok(Json(messages))
}

async fn attachment_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let data = state.attachments.read_attachment(&name).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    ))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
