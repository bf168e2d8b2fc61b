//! Access to an extension's packaged files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::error::{ExtensionError, ExtensionResult};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Read-only view of an extension package. Paths are `/`-separated and
/// relative to the package root.
#[async_trait]
pub trait ExtensionPackage: Send + Sync {
    /// Human-readable location, used in error messages.
    fn location(&self) -> String;

    async fn read_text(&self, path: &str) -> ExtensionResult<String>;

    /// Names of the immediate children of a directory, sorted.
    async fn list_dir(&self, path: &str) -> ExtensionResult<Vec<String>>;

    async fn exists(&self, path: &str) -> bool;

    /// Free temporary resources. Called after shutdown and after a failed
    /// startup; must be safe to call more than once.
    async fn release(&self);
}

/// Reject absolute paths and `..` components.
fn checked_relative(location: &str, path: &str) -> ExtensionResult<PathBuf> {
    let relative = Path::new(path);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if escapes {
        return Err(ExtensionError::Packaging {
            location: location.to_string(),
            message: format!("path '{}' escapes the package", path),
        });
    }
    Ok(relative.to_path_buf())
}

/// An unpacked extension on disk.
pub struct DirectoryPackage {
    root: PathBuf,
    /// Remove `root` on release (temporary unpacked copies).
    remove_on_release: bool,
    released: AtomicBool,
}

impl DirectoryPackage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remove_on_release: false,
            released: AtomicBool::new(false),
        }
    }

    /// A package whose directory is deleted when released.
    pub fn temporary(root: impl Into<PathBuf>) -> Self {
        Self {
            remove_on_release: true,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> ExtensionResult<PathBuf> {
        Ok(self.root.join(checked_relative(&self.location(), path)?))
    }
}

#[async_trait]
impl ExtensionPackage for DirectoryPackage {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn read_text(&self, path: &str) -> ExtensionResult<String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| ExtensionError::Packaging {
                location: full.display().to_string(),
                message: e.to_string(),
            })
    }

    async fn list_dir(&self, path: &str) -> ExtensionResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.resolve(path)?).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => tokio::fs::try_exists(full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn release(&self) {
        if !self.remove_on_release || self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            tracing::warn!(path = %self.root.display(), error = %e, "failed to remove temporary package");
        }
    }
}

/// A package held in memory.
#[derive(Default, Clone)]
pub struct MemoryPackage {
    files: BTreeMap<String, String>,
    released: Arc<AtomicBool>,
}

impl MemoryPackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    pub fn with_manifest(self, manifest: &serde_json::Value) -> Self {
        self.with_file(MANIFEST_FILE, &manifest.to_string())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtensionPackage for MemoryPackage {
    fn location(&self) -> String {
        "memory".to_string()
    }

    async fn read_text(&self, path: &str) -> ExtensionResult<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| ExtensionError::Packaging {
                location: format!("memory:{}", path),
                message: "file not found".to_string(),
            })
    }

    async fn list_dir(&self, path: &str) -> ExtensionResult<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let names: BTreeSet<String> = self
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn exists(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.contains_key(path) || self.files.keys().any(|k| k.starts_with(&prefix))
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
