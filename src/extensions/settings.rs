//! Settings derived from permissions.
//!
//! Some browser settings an extension controls exist only because it holds a
//! permission (for example `privacy` or `proxy`). Each extension's settings
//! are grouped by the permission that controls them, so that revoking the
//! permission drops exactly the settings it enabled.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

use super::error::ExtensionResult;

/// permission name -> setting key -> value
type SettingsMap = BTreeMap<String, BTreeMap<String, Value>>;

/// One extension's settings, cached in memory and written through to disk.
struct ExtensionSettings {
    /// Backing file. `None` keeps settings in memory only.
    path: Option<PathBuf>,
    cache: SettingsMap,
}

impl ExtensionSettings {
    fn open(path: Option<PathBuf>) -> Self {
        let cache = path
            .as_ref()
            .filter(|p| p.exists())
            .and_then(|p| match fs::read_to_string(p) {
                Ok(contents) => serde_json::from_str(&contents).ok(),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "failed to read settings");
                    None
                }
            })
            .unwrap_or_default();

        Self { path, cache }
    }

    fn flush(&self) -> ExtensionResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if self.cache.is_empty() {
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.cache)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

/// Settings for every extension, one file each under a directory.
pub struct SettingsStore {
    dir: Option<PathBuf>,
    open: Mutex<HashMap<String, ExtensionSettings>>,
}

impl SettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            open: Mutex::new(HashMap::new()),
        }
    }

    fn file_for(&self, extension_id: &str) -> Option<PathBuf> {
        let safe: String = extension_id
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '@' => c,
                _ => '_',
            })
            .collect();
        self.dir.as_ref().map(|d| d.join(format!("{}.json", safe)))
    }

    fn with_settings<R>(
        &self,
        extension_id: &str,
        f: impl FnOnce(&mut ExtensionSettings) -> ExtensionResult<R>,
    ) -> ExtensionResult<R> {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        let settings = open
            .entry(extension_id.to_string())
            .or_insert_with(|| ExtensionSettings::open(self.file_for(extension_id)));
        f(settings)
    }

    /// Record a setting controlled by `permission`.
    pub fn set(
        &self,
        extension_id: &str,
        permission: &str,
        key: &str,
        value: Value,
    ) -> ExtensionResult<()> {
        self.with_settings(extension_id, |s| {
            s.cache
                .entry(permission.to_string())
                .or_default()
                .insert(key.to_string(), value);
            s.flush()
        })
    }

    pub fn get(&self, extension_id: &str, permission: &str, key: &str) -> Option<Value> {
        self.with_settings(extension_id, |s| {
            Ok(s.cache.get(permission).and_then(|m| m.get(key)).cloned())
        })
        .ok()
        .flatten()
    }

    /// Permissions that currently control at least one setting.
    pub fn permissions(&self, extension_id: &str) -> Vec<String> {
        self.with_settings(extension_id, |s| Ok(s.cache.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// Drop every setting controlled by one of `permissions`. Returns the
    /// keys removed.
    pub fn remove_for_permissions(
        &self,
        extension_id: &str,
        permissions: &[String],
    ) -> ExtensionResult<Vec<String>> {
        self.with_settings(extension_id, |s| {
            let mut removed = Vec::new();
            for permission in permissions {
                if let Some(entries) = s.cache.remove(permission) {
                    removed.extend(entries.into_keys());
                }
            }
            if !removed.is_empty() {
                tracing::debug!(extension_id, ?removed, "removed settings for revoked permissions");
                s.flush()?;
            }
            Ok(removed)
        })
    }

    /// Remove all settings for an extension.
    pub fn clear(&self, extension_id: &str) -> ExtensionResult<()> {
        self.with_settings(extension_id, |s| {
            s.cache.clear();
            s.flush()
        })?;
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(extension_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_settings_basic_operations() {
        let store = SettingsStore::in_memory();
        store
            .set("ext@example.com", "privacy", "webrtc", json!("disabled"))
            .unwrap();
        assert_eq!(
            store.get("ext@example.com", "privacy", "webrtc"),
            Some(json!("disabled"))
        );
        assert_eq!(store.get("ext@example.com", "proxy", "webrtc"), None);
        assert_eq!(store.permissions("ext@example.com"), vec!["privacy"]);
    }

    #[test]
    fn test_settings_persistence() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SettingsStore::new(temp_dir.path());
            store
                .set("ext@example.com", "proxy", "mode", json!({"type": "manual"}))
                .unwrap();
        }

        let store = SettingsStore::new(temp_dir.path());
        assert_eq!(
            store.get("ext@example.com", "proxy", "mode"),
            Some(json!({"type": "manual"}))
        );
    }

    #[test]
    fn test_remove_for_permissions() {
        let store = SettingsStore::in_memory();
        store.set("ext", "privacy", "a", json!(1)).unwrap();
        store.set("ext", "privacy", "b", json!(2)).unwrap();
        store.set("ext", "proxy", "c", json!(3)).unwrap();

        let mut removed = store
            .remove_for_permissions("ext", &["privacy".to_string(), "tabs".to_string()])
            .unwrap();
        removed.sort();
        assert_eq!(removed, vec!["a", "b"]);
        assert_eq!(store.permissions("ext"), vec!["proxy"]);
    }

    #[test]
    fn test_clear_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = SettingsStore::new(temp_dir.path());
        store.set("ext@example.com", "privacy", "a", json!(true)).unwrap();
        let file = temp_dir.path().join("ext@example.com.json");
        assert!(file.exists());

        store.clear("ext@example.com").unwrap();
        assert!(!file.exists());
        assert!(store.permissions("ext@example.com").is_empty());
    }
}
