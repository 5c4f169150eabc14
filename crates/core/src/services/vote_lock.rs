//! Device-local vote lock.
//!
//! A device remembers that it voted in a room by persisting `"yes"` or
//! `"no"` under the room's lock key (`voted_<room_id>`). The lock is the only
//! thing stopping a device from voting twice, and it may go stale when the
//! room is reset while the device is not listening.
//!
//! Two [`LockStore`] implementations are provided: [`MemoryLockStore`] for
//! tests and embedding, and [`FileLockStore`], a JSON file shared by every
//! process on the device.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tally_common::{AppError, AppResult};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::warn;

use super::counts::Choice;

const LOCK_CHANGE_CAPACITY: usize = 64;

/// Whether this device has voted in a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "choice")]
pub enum VoteLock {
    #[default]
    NotVoted,
    Voted(Choice),
}

impl VoteLock {
    #[must_use]
    pub const fn has_voted(&self) -> bool {
        matches!(self, Self::Voted(_))
    }

    #[must_use]
    pub const fn choice(&self) -> Option<Choice> {
        match self {
            Self::Voted(choice) => Some(*choice),
            Self::NotVoted => None,
        }
    }

    /// Interpret a persisted lock value.
    #[must_use]
    pub fn from_stored(value: Option<&str>) -> Self {
        match value {
            None => Self::NotVoted,
            Some(raw) => match raw.parse::<Choice>() {
                Ok(choice) => Self::Voted(choice),
                Err(_) => {
                    warn!(value = raw, "Ignoring unrecognized vote lock value");
                    Self::NotVoted
                }
            },
        }
    }
}

/// A lock key changed through some handle of a [`LockStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChange {
    pub key: String,
    /// New value, `None` when removed.
    pub value: Option<String>,
}

/// Persistent string storage for vote locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Stored value, `None` when the key is absent.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> AppResult<()>;

    async fn remove(&self, key: &str) -> AppResult<()>;

    /// Changes made through any handle sharing this store.
    fn watch(&self) -> broadcast::Receiver<LockChange>;
}

/// In-memory lock store. Clones share contents and change notifications.
#[derive(Clone)]
pub struct MemoryLockStore {
    values: Arc<RwLock<HashMap<String, String>>>,
    changes: broadcast::Sender<LockChange>,
}

impl MemoryLockStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(LOCK_CHANGE_CAPACITY);
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let previous = self
            .values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        if previous.as_deref() != Some(value) {
            notify(&self.changes, key, Some(value));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        if self.values.write().await.remove(key).is_some() {
            notify(&self.changes, key, None);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<LockChange> {
        self.changes.subscribe()
    }
}

/// Lock store persisted as a JSON object in one file.
///
/// Every read goes to disk, so changes made by other processes are seen on
/// the next read. Only changes made through this process are announced on
/// [`LockStore::watch`].
#[derive(Clone)]
pub struct FileLockStore {
    path: PathBuf,
    write_guard: Arc<Mutex<()>>,
    changes: broadcast::Sender<LockChange>,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(LOCK_CHANGE_CAPACITY);
        Self {
            path: path.into(),
            write_guard: Arc::new(Mutex::new(())),
            changes,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> AppResult<HashMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Storage(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(AppError::Storage(format!("{}: {e}", self.path.display()))),
        }
    }

    async fn save(&self, values: &HashMap<String, String>) -> AppResult<()> {
        let storage_err =
            |e: std::io::Error| AppError::Storage(format!("{}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }

        let bytes = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(storage_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(storage_err)
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let _guard = self.write_guard.lock().await;
        let mut values = self.load().await?;
        let previous = values.insert(key.to_string(), value.to_string());
        self.save(&values).await?;
        if previous.as_deref() != Some(value) {
            notify(&self.changes, key, Some(value));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        let _guard = self.write_guard.lock().await;
        let mut values = self.load().await?;
        if values.remove(key).is_some() {
            self.save(&values).await?;
            notify(&self.changes, key, None);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<LockChange> {
        self.changes.subscribe()
    }
}

fn notify(changes: &broadcast::Sender<LockChange>, key: &str, value: Option<&str>) {
    // No watchers is fine.
    let _ = changes.send(LockChange {
        key: key.to_string(),
        value: value.map(String::from),
    });
}
