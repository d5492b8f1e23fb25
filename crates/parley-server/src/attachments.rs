//! Disk-backed attachment storage.
//!
//! Uploaded bytes are written once under a generated name and never
//! modified. The name is the attachment reference handed to clients.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServerError;

/// Attempts at drawing a fresh name before giving up.
const MAX_NAME_ATTEMPTS: usize = 3;

/// Durable blob storage for chat attachments.
#[async_trait]
pub trait AttachmentStore: Send + Sync + 'static {
    /// Store `data` under a freshly generated unique name ending in
    /// `.{extension}` and return that name.
    async fn persist_attachment(&self, extension: &str, data: &[u8]) -> Result<String, ServerError>;

    async fn read_attachment(&self, reference: &str) -> Result<Vec<u8>, ServerError>;

    /// Delete a stored attachment. Used to undo a write whose message never
    /// made it to the store.
    async fn remove_attachment(&self, reference: &str) -> Result<(), ServerError>;
}

/// `<unix-millis>-<uuid>.<ext>`: the timestamp keeps listings roughly
/// chronological, the UUID makes concurrent submissions distinct.
pub fn generate_name(extension: &str) -> String {
    format!(
        "{}-{}.{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        extension
    )
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let mut resolved = base.to_path_buf();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            _ => {
                return Err(ServerError::BadRequest(
                    "Path traversal detected".to_string(),
                ));
            }
        }
    }
    if !resolved.starts_with(base) || resolved == base {
        return Err(ServerError::BadRequest(
            "Path traversal detected".to_string(),
        ));
    }
    Ok(resolved)
}

#[derive(Debug, Clone)]
pub struct DiskAttachmentStore {
    base_path: PathBuf,
    max_size: usize,
}

impl DiskAttachmentStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!(
                "Failed to create uploads directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    /// Resolve a client-supplied reference. Only a single plain file name is
    /// accepted.
    fn safe_path(&self, reference: &str) -> Result<PathBuf, ServerError> {
        if reference.is_empty()
            || reference.contains('/')
            || reference.contains('\\')
            || reference.contains("..")
        {
            return Err(ServerError::BadRequest(
                "Path traversal detected".to_string(),
            ));
        }
        ensure_within(&self.base_path, &self.base_path.join(reference))
    }

    async fn write_new(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        // create_new: an existing file is never overwritten.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let written = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(path).await;
        }
        written
    }
}

#[async_trait]
impl AttachmentStore for DiskAttachmentStore {
    async fn persist_attachment(&self, extension: &str, data: &[u8]) -> Result<String, ServerError> {
        if data.len() > self.max_size {
            return Err(ServerError::AttachmentTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = generate_name(extension);
            let path = self.safe_path(&name)?;

            match self.write_new(&path, data).await {
                Ok(()) => {
                    debug!(name = %name, size = data.len(), "Stored attachment");
                    return Ok(name);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!(name = %name, "Attachment name collision, retrying");
                }
                Err(e) => {
                    return Err(ServerError::AttachmentStorage(format!(
                        "Failed to write attachment {}: {}",
                        name, e
                    )));
                }
            }
        }

        Err(ServerError::AttachmentStorage(
            "Could not allocate a unique attachment name".to_string(),
        ))
    }

    async fn read_attachment(&self, reference: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.safe_path(reference)?;

        match fs::read(&path).await {
            Ok(data) => {
                debug!(name = %reference, size = data.len(), "Read attachment");
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ServerError::AttachmentNotFound(reference.to_string()))
            }
            Err(e) => Err(ServerError::AttachmentStorage(format!(
                "Failed to read attachment {}: {}",
                reference, e
            ))),
        }
    }

    async fn remove_attachment(&self, reference: &str) -> Result<(), ServerError> {
        let path = self.safe_path(reference)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(name = %reference, "Removed attachment");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ServerError::AttachmentNotFound(reference.to_string()))
            }
            Err(e) => Err(ServerError::AttachmentStorage(format!(
                "Failed to remove attachment {}: {}",
                reference, e
            ))),
        }
    }
}
