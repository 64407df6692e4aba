//! Offline queue persistence
//!
//! The message queue writes a full snapshot after every mutation and reads the
//! latest one back when a client is created, so messages queued while offline
//! survive a restart.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::PersistenceError;
use crate::message::Message;
use crate::types::Timestamp;

/// Persisted state of the outbound queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub messages: Vec<Message>,
    pub saved_at: Timestamp,
}

/// Storage backend for queue snapshots
pub trait OfflineStore: Send + Sync {
    /// Replace the stored snapshot
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError>;

    /// Load the stored snapshot, if any
    fn load(&self) -> Result<Option<QueueSnapshot>, PersistenceError>;

    /// Remove the stored snapshot
    fn clear(&self) -> Result<(), PersistenceError>;
}

// ----------------------------------------------------------------------------
// Memory Store
// ----------------------------------------------------------------------------

/// In-process store; clones share the same slot
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<QueueSnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages in the stored snapshot
    pub fn stored_len(&self) -> usize {
        self.slot.lock().as_ref().map_or(0, |s| s.messages.len())
    }
}

impl OfflineStore for MemoryStore {
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<QueueSnapshot>, PersistenceError> {
        Ok(self.slot.lock().clone())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// JSON File Store
// ----------------------------------------------------------------------------

/// Snapshot stored as a JSON file, replaced atomically through a temp file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl OfflineStore for JsonFileStore {
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        fs::write(&temp, json)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<QueueSnapshot>, PersistenceError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
