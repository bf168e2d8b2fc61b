//! Process-wide extension registry and the services every instance uses.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;

use super::classifier::PermissionClassifier;
use super::collaborators::{
    ContentScriptEngine, ManifestEntryHandler, NoopCollaborators, SitePermissions,
    StorageMigrationTracker, StorageService,
};
use super::events::EventBus;
use super::manifest_cache::ManifestCache;
use super::permission_store::{JsonFilePermissionStore, MemoryPermissionStore, PermissionStore};
use super::permissions::PermissionSet;
use super::settings::SettingsStore;
use super::shared_state::SharedStatePropagator;

#[derive(Default)]
struct RegistryState {
    active: BTreeSet<String>,
    pending: BTreeSet<String>,
    uuids: HashMap<String, String>,
    last_required: HashMap<String, PermissionSet>,
}

/// Which extensions exist and what state they are in.
#[derive(Default)]
pub struct ExtensionRegistry {
    state: Mutex<RegistryState>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The host uuid for an extension, assigned on first use.
    pub fn uuid_for(&self, extension_id: &str) -> String {
        self.state()
            .uuids
            .entry(extension_id.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub fn forget_uuid(&self, extension_id: &str) -> Option<String> {
        self.state().uuids.remove(extension_id)
    }

    pub fn mark_pending(&self, extension_id: &str) {
        let mut state = self.state();
        state.active.remove(extension_id);
        state.pending.insert(extension_id.to_string());
    }

    pub fn mark_active(&self, extension_id: &str) {
        let mut state = self.state();
        state.pending.remove(extension_id);
        state.active.insert(extension_id.to_string());
    }

    pub fn remove(&self, extension_id: &str) {
        let mut state = self.state();
        state.pending.remove(extension_id);
        state.active.remove(extension_id);
    }

    pub fn is_active(&self, extension_id: &str) -> bool {
        self.state().active.contains(extension_id)
    }

    pub fn is_pending(&self, extension_id: &str) -> bool {
        self.state().pending.contains(extension_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.state().active.iter().cloned().collect()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.state().pending.iter().cloned().collect()
    }

    /// Remember what the running version requires, for the next upgrade.
    pub fn set_last_required(&self, extension_id: &str, required: PermissionSet) {
        self.state()
            .last_required
            .insert(extension_id.to_string(), required);
    }

    pub fn last_required(&self, extension_id: &str) -> Option<PermissionSet> {
        self.state().last_required.get(extension_id).cloned()
    }

    pub fn forget(&self, extension_id: &str) {
        let mut state = self.state();
        state.pending.remove(extension_id);
        state.active.remove(extension_id);
        state.uuids.remove(extension_id);
        state.last_required.remove(extension_id);
    }
}

/// Everything an extension instance depends on, built once per process.
pub struct RuntimeServices {
    pub config: RuntimeConfig,
    pub classifier: PermissionClassifier,
    pub cache: ManifestCache,
    pub permission_store: Arc<dyn PermissionStore>,
    pub settings: SettingsStore,
    pub propagator: SharedStatePropagator,
    pub events: EventBus,
    pub registry: ExtensionRegistry,
    pub storage: Arc<dyn StorageService>,
    pub content_scripts: Arc<dyn ContentScriptEngine>,
    pub site_permissions: Arc<dyn SitePermissions>,
    pub entry_handlers: Vec<Arc<dyn ManifestEntryHandler>>,
    pub migrations: StorageMigrationTracker,
}

impl RuntimeServices {
    fn with_stores(
        config: RuntimeConfig,
        permission_store: Arc<dyn PermissionStore>,
        settings: SettingsStore,
    ) -> Self {
        let noop = Arc::new(NoopCollaborators::new());
        Self {
            classifier: PermissionClassifier::new(config.features),
            config,
            cache: ManifestCache::new(),
            permission_store,
            settings,
            propagator: SharedStatePropagator::new(),
            events: EventBus::new(),
            registry: ExtensionRegistry::new(),
            storage: noop.clone(),
            content_scripts: noop.clone(),
            site_permissions: noop,
            entry_handlers: Vec::new(),
            migrations: StorageMigrationTracker::new(),
        }
    }

    /// File-backed grants and settings under the configured data directory.
    pub fn from_config(config: RuntimeConfig) -> Self {
        let store = Arc::new(JsonFilePermissionStore::new(config.storage.permissions_path()));
        let settings = SettingsStore::new(config.storage.settings_dir());
        Self::with_stores(config, store, settings)
    }

    /// Nothing touches the filesystem.
    pub fn in_memory(config: RuntimeConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(MemoryPermissionStore::new()),
            SettingsStore::in_memory(),
        )
    }

    pub fn with_permission_store(mut self, store: Arc<dyn PermissionStore>) -> Self {
        self.permission_store = store;
        self
    }

    pub fn with_settings(mut self, settings: SettingsStore) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageService>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_content_scripts(mut self, engine: Arc<dyn ContentScriptEngine>) -> Self {
        self.content_scripts = engine;
        self
    }

    pub fn with_site_permissions(mut self, site_permissions: Arc<dyn SitePermissions>) -> Self {
        self.site_permissions = site_permissions;
        self
    }

    /// Install every collaborator from one value.
    pub fn with_collaborators<C>(self, collaborators: C) -> Self
    where
        C: StorageService + ContentScriptEngine + SitePermissions + 'static,
    {
        let shared = Arc::new(collaborators);
        self.with_storage(shared.clone())
            .with_content_scripts(shared.clone())
            .with_site_permissions(shared)
    }

    pub fn with_entry_handler(mut self, handler: Arc<dyn ManifestEntryHandler>) -> Self {
        self.entry_handlers.push(handler);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_then_active() {
        let registry = ExtensionRegistry::new();
        registry.mark_pending("a");
        assert!(registry.is_pending("a"));
        assert!(!registry.is_active("a"));

        registry.mark_active("a");
        assert!(!registry.is_pending("a"));
        assert_eq!(registry.active_ids(), vec!["a"]);

        registry.remove("a");
        assert!(registry.active_ids().is_empty());
    }

    #[test]
    fn test_uuid_stable_until_forgotten() {
        let registry = ExtensionRegistry::new();
        let first = registry.uuid_for("a");
        assert_eq!(registry.uuid_for("a"), first);
        assert_ne!(registry.uuid_for("b"), first);

        registry.forget("a");
        assert_ne!(registry.uuid_for("a"), first);
    }
}
