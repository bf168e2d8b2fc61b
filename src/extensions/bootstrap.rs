//! Entry points called by the host add-on manager.
//!
//! Each add-on gets a handle with its own lock, so operations on one
//! instance run one at a time while different add-ons proceed
//! independently. Shutdown triggers the instance's signal before taking the
//! lock, which lets a startup that is still holding it unwind early.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use super::error::{ExtensionError, ExtensionResult};
use super::kinds::AddonInstance;
use super::lifecycle::{AddonData, BootstrapReason, ShutdownReport, ShutdownSignal};
use super::manifest::AddonType;
use super::permissions::PermissionSet;
use super::registry::RuntimeServices;

struct AddonHandle {
    signal: ShutdownSignal,
    instance: AsyncMutex<AddonInstance>,
}

/// Snapshot of one add-on for [`AddonBootstrap::fetch_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonState {
    pub id: String,
    #[serde(rename = "type")]
    pub addon_type: AddonType,
    /// `None` while another operation holds the instance.
    pub phase: Option<String>,
    pub version: Option<String>,
    pub permissions: Option<PermissionSet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapState {
    pub active: Vec<String>,
    pub pending: Vec<String>,
    pub addons: Vec<AddonState>,
}

pub struct AddonBootstrap {
    services: Arc<RuntimeServices>,
    addons: Mutex<HashMap<String, Arc<AddonHandle>>>,
}

impl AddonBootstrap {
    pub fn new(services: Arc<RuntimeServices>) -> Self {
        Self {
            services,
            addons: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.services
    }

    fn addons(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AddonHandle>>> {
        self.addons.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, extension_id: &str) -> ExtensionResult<Arc<AddonHandle>> {
        self.addons()
            .get(extension_id)
            .cloned()
            .ok_or_else(|| ExtensionError::ExtensionNotFound(extension_id.to_string()))
    }

    fn detach(&self, extension_id: &str, handle: &Arc<AddonHandle>) {
        let mut addons = self.addons();
        if addons
            .get(extension_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            addons.remove(extension_id);
        }
    }

    /// Called once when the add-on is installed, before its first startup.
    pub async fn install(&self, data: &AddonData) -> ExtensionResult<()> {
        tracing::info!(extension_id = %data.id, version = %data.version, "installing add-on");
        self.services.cache.invalidate(&data.id);
        Ok(())
    }

    /// Start an add-on instance.
    pub async fn startup(&self, data: AddonData, reason: BootstrapReason) -> ExtensionResult<()> {
        let id = data.id.clone();
        let signal = ShutdownSignal::new();
        let handle = Arc::new(AddonHandle {
            signal: signal.clone(),
            instance: AsyncMutex::new(AddonInstance::new(data, self.services.clone(), signal)),
        });

        {
            let mut addons = self.addons();
            if addons.contains_key(&id) {
                return Err(ExtensionError::AlreadyStarted(id));
            }
            addons.insert(id.clone(), handle.clone());
        }

        let mut instance = handle.instance.lock().await;
        let result = instance.owner_mut().startup(reason).await;
        drop(instance);
        if result.is_err() {
            self.detach(&id, &handle);
        }
        result
    }

    /// Shut down a running add-on.
    pub async fn shutdown(
        &self,
        extension_id: &str,
        reason: BootstrapReason,
    ) -> ExtensionResult<ShutdownReport> {
        let handle = self.handle(extension_id)?;
        handle.signal.trigger();
        let mut instance = handle.instance.lock().await;
        let report = instance.owner_mut().shutdown(reason).await;
        drop(instance);
        self.detach(extension_id, &handle);
        Ok(report)
    }

    /// A new version was installed. A running extension adopts it in place;
    /// otherwise the next startup migrates.
    pub async fn update(&self, data: AddonData, reason: BootstrapReason) -> ExtensionResult<()> {
        tracing::info!(extension_id = %data.id, version = %data.version, %reason, "updating add-on");
        let Ok(handle) = self.handle(&data.id) else {
            self.services.cache.invalidate(&data.id);
            return Ok(());
        };

        let mut instance = handle.instance.lock().await;
        match instance.as_extension_mut() {
            Some(extension) => extension.apply_staged_update(data).await,
            None => {
                self.services.cache.invalidate(&data.id);
                Ok(())
            }
        }
    }

    /// Remove every trace of an add-on.
    pub async fn uninstall(&self, extension_id: &str) -> ExtensionResult<()> {
        if self.handle(extension_id).is_ok() {
            self.shutdown(extension_id, BootstrapReason::AddonUninstall)
                .await?;
        }

        let services = &self.services;
        services.permission_store.remove(extension_id).await?;
        services.settings.clear(extension_id)?;
        services.cache.invalidate(extension_id);
        if let Some(uuid) = services.registry.forget_uuid(extension_id) {
            services
                .storage
                .clear_principal_data(extension_id, &uuid)
                .await?;
        }
        services.registry.forget(extension_id);
        tracing::info!(extension_id, "uninstalled add-on");
        Ok(())
    }

    pub async fn add_permissions(
        &self,
        extension_id: &str,
        request: &PermissionSet,
    ) -> ExtensionResult<PermissionSet> {
        let handle = self.handle(extension_id)?;
        let mut instance = handle.instance.lock().await;
        instance
            .as_extension_mut()
            .ok_or_else(|| ExtensionError::ExtensionNotFound(extension_id.to_string()))?
            .add_permissions(request)
            .await
    }

    pub async fn remove_permissions(
        &self,
        extension_id: &str,
        request: &PermissionSet,
    ) -> ExtensionResult<PermissionSet> {
        let handle = self.handle(extension_id)?;
        let mut instance = handle.instance.lock().await;
        instance
            .as_extension_mut()
            .ok_or_else(|| ExtensionError::ExtensionNotFound(extension_id.to_string()))?
            .remove_permissions(request)
            .await
    }

    /// Report every known add-on. Never waits for an instance lock.
    pub fn fetch_state(&self) -> BootstrapState {
        let handles: Vec<(String, Arc<AddonHandle>)> = self
            .addons()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut addons: Vec<AddonState> = handles
            .into_iter()
            .map(|(id, handle)| match handle.instance.try_lock() {
                Ok(instance) => {
                    let owner = instance.owner();
                    AddonState {
                        id,
                        addon_type: owner.addon_type(),
                        phase: Some(owner.phase().to_string()),
                        version: owner.manifest().map(|m| m.version.clone()),
                        permissions: instance.as_extension().and_then(|e| e.permissions()),
                    }
                }
                Err(_) => AddonState {
                    id,
                    addon_type: AddonType::Extension,
                    phase: None,
                    version: None,
                    permissions: None,
                },
            })
            .collect();
        addons.sort_by(|a, b| a.id.cmp(&b.id));

        BootstrapState {
            active: self.services.registry.active_ids(),
            pending: self.services.registry.pending_ids(),
            addons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::extensions::collaborators::{CollaboratorCall, NoopCollaborators};
    use crate::extensions::package::MemoryPackage;
    use serde_json::json;

    const ID: &str = "boot@example.com";

    fn bootstrap(noop: NoopCollaborators) -> AddonBootstrap {
        AddonBootstrap::new(Arc::new(
            RuntimeServices::in_memory(RuntimeConfig::default()).with_collaborators(noop),
        ))
    }

    fn data(version: &str, optional: &[&str]) -> AddonData {
        let package = MemoryPackage::new().with_manifest(&json!({
            "manifest_version": 2,
            "name": "Boot",
            "version": version,
            "permissions": ["storage"],
            "optional_permissions": optional,
        }));
        AddonData::new(ID, version, Arc::new(package))
    }

    #[tokio::test]
    async fn test_startup_twice_rejected() {
        let boot = bootstrap(NoopCollaborators::new());
        boot.startup(data("1.0", &[]), BootstrapReason::AppStartup)
            .await
            .unwrap();
        let err = boot
            .startup(data("1.0", &[]), BootstrapReason::AppStartup)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::AlreadyStarted(_)));

        let state = boot.fetch_state();
        assert_eq!(state.active, vec![ID]);
        assert_eq!(state.addons[0].phase.as_deref(), Some("Running"));
    }

    #[tokio::test]
    async fn test_shutdown_unknown_addon() {
        let boot = bootstrap(NoopCollaborators::new());
        let err = boot
            .shutdown("missing@example.com", BootstrapReason::AppShutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::ExtensionNotFound(_)));
    }

    #[tokio::test]
    async fn test_uninstall_clears_everything() {
        let noop = NoopCollaborators::new();
        let boot = bootstrap(noop.clone());
        boot.install(&data("1.0", &["bookmarks"])).await.unwrap();
        boot.startup(data("1.0", &["bookmarks"]), BootstrapReason::AddonInstall)
            .await
            .unwrap();
        boot.add_permissions(ID, &PermissionSet::from_parts(["bookmarks"], [], []))
            .await
            .unwrap();
        let uuid = boot.services().registry.uuid_for(ID);

        boot.uninstall(ID).await.unwrap();
        let services = boot.services();
        assert!(services.permission_store.load(ID).await.unwrap().is_empty());
        assert!(services.cache.is_empty());
        assert!(boot.fetch_state().addons.is_empty());
        assert_ne!(services.registry.uuid_for(ID), uuid);
        assert!(noop
            .calls()
            .contains(&CollaboratorCall::ClearPrincipalData(ID.into())));
    }

    #[tokio::test]
    async fn test_update_running_extension() {
        let boot = bootstrap(NoopCollaborators::new());
        boot.startup(data("1.0", &[]), BootstrapReason::AppStartup)
            .await
            .unwrap();
        boot.update(data("2.0", &["bookmarks"]), BootstrapReason::AddonUpgrade)
            .await
            .unwrap();
        assert_eq!(
            boot.services().propagator.published(ID).unwrap().version,
            "2.0"
        );
        boot.add_permissions(ID, &PermissionSet::from_parts(["bookmarks"], [], []))
            .await
            .unwrap();
    }
}
