//! Virtual file buffers registered with the engine host.
//!
//! The host owns a file namespace shared by every connection of one
//! database; the caller refers to buffers by name only. All mutations
//! round-trip through the host and are awaited to completion, so local
//! bookkeeping never runs ahead of what the engine can see.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::channel::MessageChannel;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::Payload;

/// Caller-side state for one registered buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Registered buffer size in bytes.
    pub size: usize,
}

/// Name → buffer-state table for the host's file namespace.
///
/// Mutations go through [`Database`](crate::database::Database), which
/// checks the open state and the in-flight query guard before delegating
/// here; this handle only exposes read-only inspection.
pub struct VirtualFileStore {
    channel: Arc<MessageChannel>,
    files: Mutex<HashMap<String, FileEntry>>,
}

impl VirtualFileStore {
    pub(crate) fn new(channel: Arc<MessageChannel>) -> Self {
        Self {
            channel,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Register a named byte buffer with the engine host.
    ///
    /// Re-registering an existing name replaces its buffer.
    pub(crate) async fn register_buffer(
        &self,
        name: impl Into<String>,
        buffer: Vec<u8>,
    ) -> BridgeResult<()> {
        let name = name.into();
        let size = buffer.len();
        match self
            .channel
            .request(Payload::RegisterFileRequest {
                name: name.clone(),
                buffer,
            })
            .await?
        {
            Payload::RegisterFileResponse => {
                debug!("registered virtual file {} ({} bytes)", name, size);
                self.files
                    .lock()
                    .expect("file table poisoned")
                    .insert(name, FileEntry { size });
                Ok(())
            }
            other => Err(BridgeError::protocol(format!(
                "expected register-file-response, got {}",
                other.kind()
            ))),
        }
    }

    /// Force pending virtual file writes to be visible to the engine.
    ///
    /// Completes only after the host acknowledgment; a query issued after
    /// this returns is guaranteed to see the flushed data.
    pub(crate) async fn flush(&self) -> BridgeResult<()> {
        match self.channel.request(Payload::FlushRequest).await? {
            Payload::FlushResponse => Ok(()),
            other => Err(BridgeError::protocol(format!(
                "expected flush-response, got {}",
                other.kind()
            ))),
        }
    }

    /// Drop a single named buffer.
    pub(crate) async fn drop_file(&self, name: &str) -> BridgeResult<()> {
        if !self.contains(name) {
            return Err(BridgeError::Resource(format!(
                "virtual file {:?} is not registered",
                name
            )));
        }
        match self
            .channel
            .request(Payload::DropFileRequest {
                name: name.to_string(),
            })
            .await?
        {
            Payload::DropFileResponse => {
                self.files.lock().expect("file table poisoned").remove(name);
                Ok(())
            }
            other => Err(BridgeError::protocol(format!(
                "expected drop-file-response, got {}",
                other.kind()
            ))),
        }
    }

    /// Drop every registered buffer, invalidating all names.
    pub(crate) async fn drop_all(&self) -> BridgeResult<()> {
        match self.channel.request(Payload::DropRequest).await? {
            Payload::DropResponse => {
                let mut files = self.files.lock().expect("file table poisoned");
                debug!("dropped {} virtual files", files.len());
                files.clear();
                Ok(())
            }
            other => Err(BridgeError::protocol(format!(
                "expected drop-response, got {}",
                other.kind()
            ))),
        }
    }

    /// Whether a name is currently registered.
    pub fn contains(&self, name: &str) -> bool {
        self.files
            .lock()
            .expect("file table poisoned")
            .contains_key(name)
    }

    /// Names currently registered, in no particular order.
    pub fn registered(&self) -> Vec<String> {
        self.files
            .lock()
            .expect("file table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Caller-side state for one name.
    pub fn entry(&self, name: &str) -> Option<FileEntry> {
        self.files
            .lock()
            .expect("file table poisoned")
            .get(name)
            .cloned()
    }

    /// Forget all local bookkeeping without a host round-trip. Used when
    /// the database is terminated and the host is already gone.
    pub(crate) fn clear_local(&self) {
        self.files.lock().expect("file table poisoned").clear();
    }
}
