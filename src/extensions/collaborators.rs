//! Narrow contracts for the systems the lifecycle calls out to.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use super::descriptor::ExtensionDescriptor;
use super::error::ExtensionResult;

/// Per-origin storage owned by the embedding browser.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Drop caches derived from a previous version of the package.
    async fn clear_caches(&self, extension_id: &str) -> ExtensionResult<()>;

    /// Delete everything stored for the extension's origin.
    async fn clear_principal_data(&self, extension_id: &str, uuid: &str) -> ExtensionResult<()>;

    /// Mark the extension's origin storage as persistent.
    async fn grant_persistent_storage(&self, extension_id: &str, uuid: &str)
        -> ExtensionResult<()>;
}

#[async_trait]
pub trait ContentScriptEngine: Send + Sync {
    async fn register(&self, descriptor: &ExtensionDescriptor) -> ExtensionResult<()>;
    async fn unregister(&self, extension_id: &str);
}

/// Site permissions granted to the extension's origin at runtime.
#[async_trait]
pub trait SitePermissions: Send + Sync {
    /// Revoke grants that must not outlive the session (e.g. geolocation).
    async fn revoke_session_permissions(&self, extension_id: &str, base_url: &str);
}

/// Initializer for one manifest key, run during startup when the key is
/// present.
#[async_trait]
pub trait ManifestEntryHandler: Send + Sync {
    fn key(&self) -> &str;

    async fn on_manifest_entry(&self, extension_id: &str, value: &Value) -> Result<(), String>;
}

/// Tracks in-flight storage backend migrations per extension.
#[derive(Clone)]
pub struct StorageMigrationTracker {
    in_flight: Arc<watch::Sender<HashSet<String>>>,
}

impl Default for StorageMigrationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageMigrationTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HashSet::new());
        Self {
            in_flight: Arc::new(tx),
        }
    }

    /// Mark a migration as started. It ends when the guard is dropped.
    pub fn begin(&self, extension_id: &str) -> MigrationGuard {
        self.in_flight.send_modify(|set| {
            set.insert(extension_id.to_string());
        });
        MigrationGuard {
            tracker: self.clone(),
            extension_id: extension_id.to_string(),
        }
    }

    pub fn is_migrating(&self, extension_id: &str) -> bool {
        self.in_flight.borrow().contains(extension_id)
    }

    /// Wait until no migration is running for the extension, for at most
    /// `budget`. Returns `false` if the budget ran out.
    pub async fn wait_idle(&self, extension_id: &str, budget: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        let idle = rx.wait_for(|set| !set.contains(extension_id));
        let idle_in_time = match tokio::time::timeout(budget, idle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(extension_id, "storage migration still running after shutdown budget");
                false
            }
        };
        idle_in_time
    }
}

pub struct MigrationGuard {
    tracker: StorageMigrationTracker,
    extension_id: String,
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        self.tracker.in_flight.send_modify(|set| {
            set.remove(&self.extension_id);
        });
    }
}

/// A call made on [`NoopCollaborators`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorCall {
    ClearCaches(String),
    ClearPrincipalData(String),
    GrantPersistentStorage(String),
    RegisterContentScripts(String),
    UnregisterContentScripts(String),
    RevokeSessionPermissions(String),
}

/// Collaborators that do nothing except remember what they were asked.
#[derive(Clone, Default)]
pub struct NoopCollaborators {
    calls: Arc<Mutex<Vec<CollaboratorCall>>>,
}

impl NoopCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: CollaboratorCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    pub fn calls(&self) -> Vec<CollaboratorCall> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl StorageService for NoopCollaborators {
    async fn clear_caches(&self, extension_id: &str) -> ExtensionResult<()> {
        self.record(CollaboratorCall::ClearCaches(extension_id.to_string()));
        Ok(())
    }

    async fn clear_principal_data(&self, extension_id: &str, _uuid: &str) -> ExtensionResult<()> {
        self.record(CollaboratorCall::ClearPrincipalData(extension_id.to_string()));
        Ok(())
    }

    async fn grant_persistent_storage(
        &self,
        extension_id: &str,
        _uuid: &str,
    ) -> ExtensionResult<()> {
        self.record(CollaboratorCall::GrantPersistentStorage(
            extension_id.to_string(),
        ));
        Ok(())
    }
}

#[async_trait]
impl ContentScriptEngine for NoopCollaborators {
    async fn register(&self, descriptor: &ExtensionDescriptor) -> ExtensionResult<()> {
        self.record(CollaboratorCall::RegisterContentScripts(
            descriptor.id.clone(),
        ));
        Ok(())
    }

    async fn unregister(&self, extension_id: &str) {
        self.record(CollaboratorCall::UnregisterContentScripts(
            extension_id.to_string(),
        ));
    }
}

#[async_trait]
impl SitePermissions for NoopCollaborators {
    async fn revoke_session_permissions(&self, extension_id: &str, _base_url: &str) {
        self.record(CollaboratorCall::RevokeSessionPermissions(
            extension_id.to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_bounded_by_budget() {
        let tracker = StorageMigrationTracker::new();
        let _guard = tracker.begin("a");
        assert!(tracker.is_migrating("a"));
        assert!(!tracker.wait_idle("a", Duration::from_secs(5)).await);
        assert!(tracker.wait_idle("b", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_when_guard_drops() {
        let tracker = StorageMigrationTracker::new();
        let guard = tracker.begin("a");
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle("a", Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
        assert!(!tracker.is_migrating("a"));
    }

    #[tokio::test]
    async fn test_noop_records_calls() {
        let noop = NoopCollaborators::new();
        noop.revoke_session_permissions("a", "moz-extension://u/").await;
        StorageService::clear_caches(&noop, "a").await.unwrap();
        assert_eq!(
            noop.calls(),
            vec![
                CollaboratorCall::RevokeSessionPermissions("a".into()),
                CollaboratorCall::ClearCaches("a".into()),
            ]
        );
    }
}
