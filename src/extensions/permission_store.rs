//! Persistent storage for granted permissions.
//!
//! Grants are keyed by extension id. The file-backed store keeps every
//! extension's record in a single `permissions.json`, rewritten on each save.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use super::permissions::PermissionSet;

/// Errors from the grant store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read permissions from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write permissions to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Permission store {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },
}

/// The persisted record for one extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGrants {
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub origins: BTreeSet<String>,
    #[serde(default)]
    pub data_collection: BTreeSet<String>,
}

impl From<&PermissionSet> for StoredGrants {
    fn from(set: &PermissionSet) -> Self {
        Self {
            permissions: set.permissions.clone(),
            origins: set.origins.clone(),
            data_collection: set.data_collection.clone(),
        }
    }
}

impl From<StoredGrants> for PermissionSet {
    fn from(stored: StoredGrants) -> Self {
        PermissionSet {
            permissions: stored.permissions,
            origins: stored.origins,
            data_collection: stored.data_collection,
        }
    }
}

/// Durable grant storage.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Load the grants for an extension. A missing record is an empty set.
    async fn load(&self, extension_id: &str) -> Result<PermissionSet, StorageError>;

    /// Persist the full grant set for an extension.
    async fn save(&self, extension_id: &str, grants: &PermissionSet) -> Result<(), StorageError>;

    /// Forget an extension entirely.
    async fn remove(&self, extension_id: &str) -> Result<(), StorageError>;
}

/// Grant store backed by one JSON file.
pub struct JsonFilePermissionStore {
    path: PathBuf,
    /// Lazily loaded contents of the file.
    grants: Mutex<Option<HashMap<String, StoredGrants>>>,
}

impl JsonFilePermissionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            grants: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<HashMap<String, StoredGrants>, StorageError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    async fn write_file(&self, grants: &HashMap<String, StoredGrants>) -> Result<(), StorageError> {
        let write_err = |source| StorageError::Write {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let contents = serde_json::to_string_pretty(grants).map_err(|e| StorageError::Corrupt {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        // Write to a sibling and rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;
        Ok(())
    }

    /// Run `f` over the loaded map, loading it first if necessary.
    async fn with_grants<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, StoredGrants>) -> R,
    ) -> Result<R, StorageError> {
        let mut guard = self.grants.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        let map = guard.get_or_insert_with(HashMap::new);
        Ok(f(map))
    }
}

#[async_trait]
impl PermissionStore for JsonFilePermissionStore {
    async fn load(&self, extension_id: &str) -> Result<PermissionSet, StorageError> {
        self.with_grants(|grants| {
            grants
                .get(extension_id)
                .cloned()
                .map(PermissionSet::from)
                .unwrap_or_default()
        })
        .await
    }

    async fn save(&self, extension_id: &str, grants: &PermissionSet) -> Result<(), StorageError> {
        let mut guard = self.grants.lock().await;
        let mut next = match guard.take() {
            Some(map) => map,
            None => self.read_file().await?,
        };
        let previous = next.insert(extension_id.to_string(), StoredGrants::from(grants));

        // Memory only reflects what reached disk.
        match self.write_file(&next).await {
            Ok(()) => {
                *guard = Some(next);
                Ok(())
            }
            Err(e) => {
                match previous {
                    Some(previous) => next.insert(extension_id.to_string(), previous),
                    None => next.remove(extension_id),
                };
                *guard = Some(next);
                tracing::error!(extension_id, error = %e, "failed to persist permissions");
                Err(e)
            }
        }
    }

    async fn remove(&self, extension_id: &str) -> Result<(), StorageError> {
        let mut guard = self.grants.lock().await;
        let mut next = match guard.take() {
            Some(map) => map,
            None => self.read_file().await?,
        };
        if next.remove(extension_id).is_none() {
            *guard = Some(next);
            return Ok(());
        }
        let result = self.write_file(&next).await;
        *guard = Some(next);
        result
    }
}

/// In-memory grant store with optional failure injection.
#[derive(Default, Clone)]
pub struct MemoryPermissionStore {
    grants: Arc<Mutex<HashMap<String, StoredGrants>>>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail, simulating a full disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Snapshot of the stored record, if any.
    pub async fn stored(&self, extension_id: &str) -> Option<StoredGrants> {
        self.grants.lock().await.get(extension_id).cloned()
    }
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn load(&self, extension_id: &str) -> Result<PermissionSet, StorageError> {
        Ok(self
            .grants
            .lock()
            .await
            .get(extension_id)
            .cloned()
            .map(PermissionSet::from)
            .unwrap_or_default())
    }

    async fn save(&self, extension_id: &str, grants: &PermissionSet) -> Result<(), StorageError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::Write {
                path: "memory".to_string(),
                source: std::io::Error::other("write failure injected"),
            });
        }
        self.grants
            .lock()
            .await
            .insert(extension_id.to_string(), StoredGrants::from(grants));
        Ok(())
    }

    async fn remove(&self, extension_id: &str) -> Result<(), StorageError> {
        self.grants.lock().await.remove(extension_id);
        Ok(())
    }
}
