/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE_NAME: &str = "token";

/// Default interval between heartbeat probes, in milliseconds.
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Default time a probe may stay unanswered before eviction, in milliseconds.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 1_000;

/// Maximum attachment size in bytes (50 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 50 * 1024 * 1024;

/// Longest file extension kept when naming attachments.
pub const MAX_EXTENSION_LEN: usize = 16;

/// Extension used when the submitted file name has none worth keeping.
pub const FALLBACK_EXTENSION: &str = "bin";

/// Default HTTP / WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 8000;
