use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_shared::ProtocolError;
use parley_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the HTTP API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Attachment not found: {0}")]
    AttachmentNotFound(String),

    #[error("Attachment too large: {size} bytes (max {max})")]
    AttachmentTooLarge { size: usize, max: usize },

    #[error("Attachment storage error: {0}")]
    AttachmentStorage(String),

    #[error("Message store error: {0}")]
    Store(#[from] StoreError),

    #[error("Missing or invalid session token")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::AttachmentNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::AttachmentTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::AttachmentStorage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Attachment storage error".to_string(),
            ),
            ServerError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Message store error".to_string(),
            ),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Faults on the relay path. None of these is reported to the client; they
/// are logged and confined to the connection that caused them.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No or invalid session token at handshake; the connection stays unbound.
    #[error("connection has no verified identity")]
    AuthenticationMissing,

    /// Envelope dropped without a reply.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Attachment or message write failed; nothing is delivered.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The inline file payload did not decode.
    #[error("attachment decode failure: {0}")]
    AttachmentDecodeFailure(String),

    /// Socket error or disconnect; handled like a heartbeat timeout.
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Base64(err) => RelayError::AttachmentDecodeFailure(err.to_string()),
            other => RelayError::MalformedEnvelope(other.to_string()),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::PersistenceFailure(e.to_string())
    }
}

impl From<ServerError> for RelayError {
    fn from(e: ServerError) -> Self {
        RelayError::PersistenceFailure(e.to_string())
    }
}
