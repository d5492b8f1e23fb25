use thiserror::Error;

/// Reasons an inbound wire frame is unusable.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing recipient")]
    MissingRecipient,

    #[error("Envelope carries neither text nor file")]
    EmptyEnvelope,

    #[error("Attachment payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}
