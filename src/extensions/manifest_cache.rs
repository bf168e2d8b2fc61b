//! Cache of parsed manifests across restarts of the same version.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::error::ExtensionResult;
use super::manifest::NormalizedManifest;
use super::permissions::{ManifestPermissions, PermissionSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub id: String,
    pub version: String,
    pub locale: String,
}

impl CacheKey {
    pub fn new(id: &str, version: &str, locale: &str) -> Self {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            locale: locale.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub manifest: Arc<NormalizedManifest>,
    pub permissions: ManifestPermissions,
    /// Last known active permission set, rewritten on every change.
    pub granted: Option<PermissionSet>,
}

impl CachedManifest {
    pub fn new(manifest: NormalizedManifest, permissions: ManifestPermissions) -> Self {
        Self {
            manifest: Arc::new(manifest),
            permissions,
            granted: None,
        }
    }
}

#[derive(Default)]
pub struct ManifestCache {
    entries: Mutex<HashMap<CacheKey, CachedManifest>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CachedManifest>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedManifest> {
        self.entries().get(key).cloned()
    }

    /// Return the cached entry, or run `compute` and cache its result.
    /// Failures are not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> ExtensionResult<CachedManifest>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ExtensionResult<CachedManifest>>,
    {
        if let Some(hit) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(extension_id = %key.id, version = %key.version, "manifest cache hit");
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let computed = compute().await?;
        self.entries().insert(key, computed.clone());
        Ok(computed)
    }

    /// Drop every entry for an extension, whatever its version or locale.
    pub fn invalidate(&self, extension_id: &str) {
        self.entries().retain(|key, _| key.id != extension_id);
    }

    /// Record the active permission set on every entry for an extension.
    pub fn update_permissions(&self, extension_id: &str, granted: &PermissionSet) {
        for (key, entry) in self.entries().iter_mut() {
            if key.id == extension_id {
                entry.granted = Some(granted.clone());
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::error::ExtensionError;
    use crate::extensions::manifest::{normalize, ManifestContext};
    use serde_json::json;

    fn entry() -> CachedManifest {
        let manifest = normalize(
            json!({"manifest_version": 2, "name": "C", "version": "1.0"}),
            &ManifestContext {
                id: Some("cache@example.com".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        CachedManifest::new(manifest, ManifestPermissions::default())
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let cache = ManifestCache::new();
        let key = CacheKey::new("cache@example.com", "1.0", "en-US");

        cache.get_or_compute(key.clone(), || async { Ok(entry()) }).await.unwrap();
        let hit = cache
            .get_or_compute(key, || async {
                Err(ExtensionError::ExtensionNotFound("recomputed".into()))
            })
            .await
            .unwrap();
        assert_eq!(hit.manifest.name, "C");
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let cache = ManifestCache::new();
        let key = CacheKey::new("cache@example.com", "1.0", "en-US");
        let result = cache
            .get_or_compute(key, || async {
                Err(ExtensionError::ExtensionNotFound("cache@example.com".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_and_update_permissions() {
        let cache = ManifestCache::new();
        for version in ["1.0", "2.0"] {
            cache
                .get_or_compute(CacheKey::new("cache@example.com", version, "en-US"), || async {
                    Ok(entry())
                })
                .await
                .unwrap();
        }

        let granted = PermissionSet::from_parts(["tabs"], [], []);
        cache.update_permissions("cache@example.com", &granted);
        let cached = cache
            .get(&CacheKey::new("cache@example.com", "2.0", "en-US"))
            .unwrap();
        assert_eq!(cached.granted, Some(granted));

        cache.invalidate("cache@example.com");
        assert!(cache.is_empty());
    }
}
