//! Extension lifecycle state machine.
//!
//! ```text
//! NotStarted -> LoadingManifest -> InitializingLocale -> SettingUpPermissions
//!            -> Running -> ShuttingDown -> ShutdownComplete
//! ```
//!
//! Any phase before `ShutdownComplete` may move to `Errored`, which is
//! terminal for the instance; recovering means building a new instance.
//! Shutdown may be requested in any phase. A startup in flight notices the
//! shutdown signal at its next suspension point and unwinds, retracting
//! anything it staged.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::descriptor::{DescriptorFlags, ExtensionDescriptor};
use super::error::{ExtensionError, ExtensionResult};
use super::events::ManagementEvent;
use super::kinds::load_manifest;
use super::locale::{LocaleResolver, Localizer};
use super::manifest::{AddonType, ManifestContext, NormalizedManifest};
use super::manifest_cache::CacheKey;
use super::package::ExtensionPackage;
use super::permission_manager::PermissionSetManager;
use super::permissions::PermissionSet;
use super::registry::RuntimeServices;
use super::shared_state::{BroadcastMessage, BroadcastOutcome};

/// Permission whose grant backfills persistent origin storage.
const UNLIMITED_STORAGE: &str = "unlimitedStorage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecyclePhase {
    NotStarted,
    LoadingManifest,
    InitializingLocale,
    SettingUpPermissions,
    Running,
    ShuttingDown,
    ShutdownComplete,
    Errored(String),
}

impl LifecyclePhase {
    fn rank(&self) -> u8 {
        match self {
            LifecyclePhase::NotStarted => 0,
            LifecyclePhase::LoadingManifest => 1,
            LifecyclePhase::InitializingLocale => 2,
            LifecyclePhase::SettingUpPermissions => 3,
            LifecyclePhase::Running => 4,
            LifecyclePhase::ShuttingDown => 5,
            LifecyclePhase::ShutdownComplete => 6,
            LifecyclePhase::Errored(_) => u8::MAX,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecyclePhase::ShutdownComplete | LifecyclePhase::Errored(_)
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::NotStarted => f.write_str("NotStarted"),
            LifecyclePhase::LoadingManifest => f.write_str("LoadingManifest"),
            LifecyclePhase::InitializingLocale => f.write_str("InitializingLocale"),
            LifecyclePhase::SettingUpPermissions => f.write_str("SettingUpPermissions"),
            LifecyclePhase::Running => f.write_str("Running"),
            LifecyclePhase::ShuttingDown => f.write_str("ShuttingDown"),
            LifecyclePhase::ShutdownComplete => f.write_str("ShutdownComplete"),
            LifecyclePhase::Errored(reason) => write!(f, "Errored({})", reason),
        }
    }
}

/// Why the host add-on manager invoked a bootstrap hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapReason {
    AppStartup,
    AppShutdown,
    AddonEnable,
    AddonDisable,
    AddonInstall,
    AddonUninstall,
    AddonUpgrade,
    AddonDowngrade,
}

impl BootstrapReason {
    /// Caches derived from a previous package must be dropped.
    pub fn clears_caches(self) -> bool {
        matches!(
            self,
            BootstrapReason::AddonInstall
                | BootstrapReason::AddonUpgrade
                | BootstrapReason::AddonDowngrade
        )
    }

    pub fn is_version_change(self) -> bool {
        matches!(
            self,
            BootstrapReason::AddonUpgrade | BootstrapReason::AddonDowngrade
        )
    }

    /// Whether permission-derived storage grants are applied on startup.
    pub fn backfills_storage(self) -> bool {
        !matches!(
            self,
            BootstrapReason::AppStartup | BootstrapReason::AppShutdown
        )
    }
}

impl fmt::Display for BootstrapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapReason::AppStartup => "APP_STARTUP",
            BootstrapReason::AppShutdown => "APP_SHUTDOWN",
            BootstrapReason::AddonEnable => "ADDON_ENABLE",
            BootstrapReason::AddonDisable => "ADDON_DISABLE",
            BootstrapReason::AddonInstall => "ADDON_INSTALL",
            BootstrapReason::AddonUninstall => "ADDON_UNINSTALL",
            BootstrapReason::AddonUpgrade => "ADDON_UPGRADE",
            BootstrapReason::AddonDowngrade => "ADDON_DOWNGRADE",
        };
        f.write_str(name)
    }
}

/// Forward-only phase tracking.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: LifecyclePhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: LifecyclePhase::NotStarted,
        }
    }

    pub fn current(&self) -> &LifecyclePhase {
        &self.current
    }

    pub fn advance(&mut self, to: LifecyclePhase) -> ExtensionResult<()> {
        let allowed = match (&self.current, &to) {
            (LifecyclePhase::Errored(_), _) | (LifecyclePhase::ShutdownComplete, _) => false,
            (_, LifecyclePhase::Errored(_)) => true,
            (from, to) => to.rank() > from.rank(),
        };
        if !allowed {
            return Err(ExtensionError::InvalidTransition {
                from: self.current.clone(),
                to,
            });
        }
        self.current = to;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> ExtensionResult<()> {
        self.advance(LifecyclePhase::Errored(reason.into()))
    }
}

/// Process-wide shutdown flag with wakeups for waiters.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the signal is triggered.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a trigger in between is seen.
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Run `fut` unless shutdown is requested first.
    pub async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_triggered() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = fut => Some(output),
        }
    }
}

/// What the host add-on manager knows about an add-on.
#[derive(Clone)]
pub struct AddonData {
    pub id: String,
    pub version: String,
    pub addon_type: AddonType,
    pub package: Arc<dyn ExtensionPackage>,
    pub is_privileged: bool,
    pub temporarily_installed: bool,
    pub ignore_quarantine: bool,
    /// Required permissions of the version being replaced.
    pub old_required: Option<PermissionSet>,
}

impl AddonData {
    pub fn new(id: &str, version: &str, package: Arc<dyn ExtensionPackage>) -> Self {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            addon_type: AddonType::Extension,
            package,
            is_privileged: false,
            temporarily_installed: false,
            ignore_quarantine: false,
            old_required: None,
        }
    }

    pub fn manifest_context(&self, services: &RuntimeServices) -> ManifestContext {
        ManifestContext {
            id: Some(self.id.clone()),
            temporarily_installed: self.temporarily_installed,
            is_privileged: self.is_privileged,
            flags: services.config.features,
        }
    }

    fn descriptor_flags(&self) -> DescriptorFlags {
        DescriptorFlags {
            is_privileged: self.is_privileged,
            ignore_quarantine: self.ignore_quarantine,
            temporarily_installed: self.temporarily_installed,
        }
    }
}

impl fmt::Debug for AddonData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddonData")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("addon_type", &self.addon_type)
            .field("package", &self.package.location())
            .finish()
    }
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub phase_before: LifecyclePhase,
    /// `None` when the extension was not running and nothing was sent.
    pub broadcast: Option<BroadcastOutcome>,
    /// `false` if a storage migration outlived the shutdown budget.
    pub migration_settled: bool,
    pub session_permissions_revoked: bool,
}

/// A WebExtension instance.
pub struct Extension {
    data: AddonData,
    services: Arc<RuntimeServices>,
    phase: PhaseTracker,
    signal: ShutdownSignal,
    manifest: Option<Arc<NormalizedManifest>>,
    localizer: Option<Localizer>,
    permissions: Option<PermissionSetManager>,
    descriptor: Option<ExtensionDescriptor>,
    uuid: Option<String>,
    warnings: Vec<String>,
}

impl Extension {
    pub fn new(data: AddonData, services: Arc<RuntimeServices>) -> Self {
        Self::with_signal(data, services, ShutdownSignal::new())
    }

    pub fn with_signal(
        data: AddonData,
        services: Arc<RuntimeServices>,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            data,
            services,
            phase: PhaseTracker::new(),
            signal,
            manifest: None,
            localizer: None,
            permissions: None,
            descriptor: None,
            uuid: None,
            warnings: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.data.id
    }

    pub fn data(&self) -> &AddonData {
        &self.data
    }

    pub fn phase(&self) -> &LifecyclePhase {
        self.phase.current()
    }

    pub fn descriptor(&self) -> Option<&ExtensionDescriptor> {
        self.descriptor.as_ref()
    }

    /// The localized manifest.
    pub fn manifest(&self) -> Option<&NormalizedManifest> {
        self.manifest.as_deref()
    }

    pub fn localizer(&self) -> Option<&Localizer> {
        self.localizer.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// The active permission set.
    pub fn permissions(&self) -> Option<PermissionSet> {
        self.permissions.as_ref().map(PermissionSetManager::active)
    }

    pub fn permission_manager(&self) -> Option<&PermissionSetManager> {
        self.permissions.as_ref()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    fn require_phase(&self, expected: &'static str, ok: bool) -> ExtensionResult<()> {
        if ok {
            Ok(())
        } else {
            Err(ExtensionError::InvalidPhase {
                expected,
                actual: self.phase.current().clone(),
            })
        }
    }

    fn check_cancelled(&self) -> ExtensionResult<()> {
        if self.signal.is_triggered() {
            return Err(ExtensionError::StartupAborted(self.data.id.clone()));
        }
        Ok(())
    }

    /// Await a startup step, aborting if shutdown is requested meanwhile.
    async fn step<F: Future>(&self, fut: F) -> ExtensionResult<F::Output> {
        let signal = self.signal.clone();
        signal
            .until_cancelled(fut)
            .await
            .ok_or_else(|| ExtensionError::StartupAborted(self.data.id.clone()))
    }

    fn advance(&mut self, to: LifecyclePhase) -> ExtensionResult<()> {
        tracing::debug!(extension_id = %self.data.id, phase = %to, "lifecycle transition");
        self.phase.advance(to)
    }

    /// Run the startup sequence. On failure everything acquired so far is
    /// released and the instance is left `Errored`.
    pub async fn startup(&mut self, reason: BootstrapReason) -> ExtensionResult<()> {
        self.require_phase(
            "NotStarted",
            *self.phase.current() == LifecyclePhase::NotStarted,
        )?;

        tracing::info!(extension_id = %self.data.id, %reason, "starting extension");
        match self.run_startup(reason).await {
            Ok(()) => {
                tracing::info!(extension_id = %self.data.id, "extension running");
                Ok(())
            }
            Err(e) => {
                tracing::error!(extension_id = %self.data.id, %reason, error = %e, "startup failed");
                self.cleanup_failed_startup().await;
                let _ = self.phase.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_startup(&mut self, reason: BootstrapReason) -> ExtensionResult<()> {
        let services = self.services.clone();
        let id = self.data.id.clone();

        if reason.clears_caches() {
            services.cache.invalidate(&id);
            self.step(services.storage.clear_caches(&id)).await??;
        }

        self.advance(LifecyclePhase::LoadingManifest)?;
        let ctx = self.data.manifest_context(&services);
        let key = CacheKey::new(&id, &self.data.version, services.config.locale.app_locale());
        let package = self.data.package.clone();
        let classifier = services.classifier;
        let cached = self
            .step(
                services
                    .cache
                    .get_or_compute(key, || load_manifest(package.as_ref(), &ctx, &classifier)),
            )
            .await??;

        self.advance(LifecyclePhase::InitializingLocale)?;
        let resolver = LocaleResolver::new(self.data.package.clone());
        let localizer = self
            .step(resolver.initialize(
                &id,
                &services.config.locale.preferred,
                cached.manifest.default_locale.as_deref(),
            ))
            .await??;
        let manifest = Arc::new(cached.manifest.localize(&localizer));
        self.localizer = Some(localizer);
        self.warnings = manifest.warnings.clone();
        self.warnings.extend(cached.permissions.warnings.iter().cloned());

        self.advance(LifecyclePhase::SettingUpPermissions)?;
        let mut manager = self
            .step(PermissionSetManager::load(
                &id,
                cached.permissions.clone(),
                services.permission_store.clone(),
            ))
            .await??;
        let mut revoked = manager.take_dropped();

        if reason.is_version_change() {
            let old_required = self
                .data
                .old_required
                .clone()
                .or_else(|| services.registry.last_required(&id))
                .unwrap_or_default();
            let report = self
                .step(manager.migrate(cached.permissions.clone(), &old_required))
                .await??;
            revoked.extend(&report.revoked);
        }
        self.drop_revoked_settings(&revoked);

        let uuid = services.registry.uuid_for(&id);
        let active = manager.active();
        if let Some(previous) = cached.granted.as_ref().filter(|p| **p != active) {
            tracing::warn!(
                extension_id = %id,
                cached = ?previous.names(),
                stored = ?active.names(),
                "cached permissions differ from the grant store, using the store"
            );
        }
        if reason.backfills_storage() && active.contains_permission(UNLIMITED_STORAGE) {
            self.step(services.storage.grant_persistent_storage(&id, &uuid))
                .await??;
        }

        services.cache.update_permissions(&id, &active);
        services
            .registry
            .set_last_required(&id, manager.declared().required_permissions());

        let descriptor =
            ExtensionDescriptor::build(&manifest, &active, &uuid, self.data.descriptor_flags());
        services.propagator.publish_pending(&descriptor)?;
        services.registry.mark_pending(&id);

        self.uuid = Some(uuid);
        self.permissions = Some(manager);
        self.manifest = Some(manifest.clone());
        self.descriptor = Some(descriptor.clone());
        self.check_cancelled()?;

        let entries = services
            .entry_handlers
            .iter()
            .filter_map(|handler| {
                let value = manifest.raw.get(handler.key())?.clone();
                let id = id.clone();
                Some(async move {
                    handler
                        .on_manifest_entry(&id, &value)
                        .await
                        .map_err(|message| ExtensionError::EntryInitializer {
                            key: handler.key().to_string(),
                            message,
                        })
                })
            })
            .collect::<Vec<_>>();
        for result in self.step(join_all(entries)).await? {
            result?;
        }
        self.check_cancelled()?;

        services.propagator.promote(&id);
        services.registry.mark_active(&id);
        services
            .events
            .emit(ManagementEvent::Startup { id: id.clone() });
        self.step(
            services
                .propagator
                .broadcast(BroadcastMessage::Startup { id: id.clone() }, None),
        )
        .await?;
        self.step(services.content_scripts.register(&descriptor))
            .await??;

        self.advance(LifecyclePhase::Running)?;
        services.events.emit(ManagementEvent::Ready { id });
        Ok(())
    }

    async fn cleanup_failed_startup(&mut self) {
        let services = &self.services;
        let id = &self.data.id;
        services.propagator.retract(id);
        services.registry.remove(id);
        services.cache.invalidate(id);
        services.content_scripts.unregister(id).await;
        self.data.package.release().await;
        self.descriptor = None;
    }

    /// Shut the extension down. Safe in every phase.
    pub async fn shutdown(&mut self, reason: BootstrapReason) -> ShutdownReport {
        self.signal.trigger();
        let services = self.services.clone();
        let id = self.data.id.clone();
        let phase_before = self.phase.current().clone();

        let mut report = ShutdownReport {
            phase_before: phase_before.clone(),
            broadcast: None,
            migration_settled: true,
            session_permissions_revoked: false,
        };
        if phase_before == LifecyclePhase::ShutdownComplete {
            return report;
        }

        tracing::info!(extension_id = %id, %reason, phase = %phase_before, "shutting down extension");
        if !phase_before.is_terminal() {
            let _ = self.advance(LifecyclePhase::ShuttingDown);
        }

        let config = &services.config.lifecycle;
        report.migration_settled = services
            .migrations
            .wait_idle(&id, config.shutdown_budget())
            .await;

        services
            .events
            .emit(ManagementEvent::Shutdown { id: id.clone() });

        if phase_before == LifecyclePhase::Running {
            let outcome = services
                .propagator
                .broadcast(
                    BroadcastMessage::Shutdown { id: id.clone() },
                    Some(config.shutdown_ack_timeout()),
                )
                .await;
            if !outcome.is_complete() {
                tracing::warn!(
                    extension_id = %id,
                    timed_out = ?outcome.timed_out,
                    "remote contexts did not acknowledge shutdown"
                );
            }
            report.broadcast = Some(outcome);

            if reason != BootstrapReason::AppShutdown {
                if let Some(descriptor) = &self.descriptor {
                    services
                        .site_permissions
                        .revoke_session_permissions(&id, &descriptor.base_url)
                        .await;
                    report.session_permissions_revoked = true;
                }
            }
        }

        services.content_scripts.unregister(&id).await;
        services.propagator.retract(&id);
        services.registry.remove(&id);
        self.data.package.release().await;

        if !phase_before.is_terminal() {
            let _ = self.advance(LifecyclePhase::ShutdownComplete);
        }
        tracing::info!(extension_id = %id, "extension shut down");
        report
    }

    /// Drop settings controlled by permissions that were just revoked.
    /// Failures are logged and never returned.
    fn drop_revoked_settings(&self, revoked: &PermissionSet) {
        if revoked.is_empty() {
            return;
        }
        if let Err(e) = self
            .services
            .settings
            .remove_for_permissions(&self.data.id, &revoked.names())
        {
            tracing::warn!(
                extension_id = %self.data.id,
                revoked = ?revoked.names(),
                error = %e,
                "failed to remove settings for revoked permissions"
            );
        }
    }

    fn require_running(&self) -> ExtensionResult<()> {
        self.require_phase("Running", *self.phase.current() == LifecyclePhase::Running)
    }

    /// Rebuild the descriptor from the current manifest and permissions and
    /// publish it.
    fn republish(&mut self) -> ExtensionResult<()> {
        let (Some(manager), Some(manifest), Some(uuid)) =
            (&self.permissions, &self.manifest, &self.uuid)
        else {
            return Err(ExtensionError::InvalidPhase {
                expected: "Running",
                actual: self.phase.current().clone(),
            });
        };

        let active = manager.active();
        self.services.cache.update_permissions(&self.data.id, &active);
        let descriptor =
            ExtensionDescriptor::build(manifest, &active, uuid, self.data.descriptor_flags());
        self.services.propagator.publish(&descriptor)?;
        self.descriptor = Some(descriptor);
        Ok(())
    }

    /// Tell remote contexts and event subscribers about a permission change
    /// that is already persisted and published. Returns the broadcast
    /// outcome, or `None` when shutdown cut the wait short.
    async fn notify_permissions(
        &self,
        delta: &PermissionSet,
        added: bool,
    ) -> Option<BroadcastOutcome> {
        let services = &self.services;
        let id = self.data.id.clone();
        // Shutdown only cuts the wait for acknowledgments short.
        let outcome = self
            .signal
            .until_cancelled(services.propagator.broadcast(
                BroadcastMessage::UpdatePermissions {
                    id: id.clone(),
                    delta: delta.clone(),
                    added,
                },
                None,
            ))
            .await;
        match &outcome {
            Some(outcome) if !outcome.is_complete() => tracing::debug!(
                extension_id = %id,
                timed_out = ?outcome.timed_out,
                "remote contexts did not acknowledge permission change"
            ),
            None => tracing::debug!(
                extension_id = %id,
                "permission change broadcast cut short by shutdown"
            ),
            Some(_) => {}
        }

        let (added_set, removed_set) = if added {
            (delta.clone(), PermissionSet::default())
        } else {
            (PermissionSet::default(), delta.clone())
        };
        services.events.emit(ManagementEvent::PermissionsChanged {
            id,
            added: added_set,
            removed: removed_set,
        });
        outcome
    }

    /// Grant optional permissions at runtime.
    pub async fn add_permissions(&mut self, request: &PermissionSet) -> ExtensionResult<PermissionSet> {
        self.require_running()?;
        let manager = self
            .permissions
            .as_mut()
            .ok_or_else(|| ExtensionError::ExtensionNotFound(self.data.id.clone()))?;
        let added = manager.add(request).await?;
        if !added.is_empty() {
            tracing::info!(extension_id = %self.data.id, added = ?added.names(), "permissions granted");
            self.republish()?;
            self.notify_permissions(&added, true).await;
        }
        Ok(added)
    }

    /// Revoke optional permissions at runtime. Settings controlled by the
    /// revoked permissions are removed.
    pub async fn remove_permissions(
        &mut self,
        request: &PermissionSet,
    ) -> ExtensionResult<PermissionSet> {
        self.require_running()?;
        let manager = self
            .permissions
            .as_mut()
            .ok_or_else(|| ExtensionError::ExtensionNotFound(self.data.id.clone()))?;
        let removed = manager.remove(request).await?;
        if !removed.is_empty() {
            tracing::info!(extension_id = %self.data.id, removed = ?removed.names(), "permissions revoked");
            self.drop_revoked_settings(&removed);
            self.republish()?;
            self.notify_permissions(&removed, false).await;
        }
        Ok(removed)
    }

    /// Adopt a staged update without restarting.
    ///
    /// The new manifest only becomes authoritative after permission
    /// migration has been persisted. From then on the swap always completes,
    /// so the permission manager and the manifest agree.
    pub async fn apply_staged_update(&mut self, data: AddonData) -> ExtensionResult<()> {
        self.require_running()?;
        let services = self.services.clone();
        let id = self.data.id.clone();

        services.cache.invalidate(&id);
        let ctx = data.manifest_context(&services);
        let key = CacheKey::new(&id, &data.version, services.config.locale.app_locale());
        let package = data.package.clone();
        let classifier = services.classifier;
        let cached = services
            .cache
            .get_or_compute(key, || load_manifest(package.as_ref(), &ctx, &classifier))
            .await?;

        let localizer = LocaleResolver::new(data.package.clone())
            .initialize(
                &id,
                &services.config.locale.preferred,
                cached.manifest.default_locale.as_deref(),
            )
            .await?;
        let manifest = Arc::new(cached.manifest.localize(&localizer));

        let manager = self
            .permissions
            .as_mut()
            .ok_or_else(|| ExtensionError::ExtensionNotFound(id.clone()))?;
        let old_required = manager.declared().required_permissions();
        let before = manager.active();
        let report = manager
            .migrate(cached.permissions.clone(), &old_required)
            .await?;
        let after = manager.active();
        let required = manager.declared().required_permissions();

        services.registry.set_last_required(&id, required);
        self.drop_revoked_settings(&report.revoked);
        self.warnings = manifest.warnings.clone();
        self.warnings.extend(cached.permissions.warnings.iter().cloned());
        self.manifest = Some(manifest);
        self.localizer = Some(localizer);
        let previous_package = std::mem::replace(&mut self.data, data).package;
        if !Arc::ptr_eq(&previous_package, &self.data.package) {
            previous_package.release().await;
        }

        tracing::info!(extension_id = %id, version = %self.data.version, "applied staged update");
        self.republish()?;
        let gained = after.difference(&before);
        let lost = before.difference(&after);
        if !lost.is_empty() {
            self.notify_permissions(&lost, false).await;
        }
        if !gained.is_empty() {
            self.notify_permissions(&gained, true).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::extensions::collaborators::{CollaboratorCall, NoopCollaborators};
    use crate::extensions::manifest::MAX_NAME_LENGTH;
    use crate::extensions::package::MemoryPackage;
    use crate::extensions::settings::SettingsStore;
    use serde_json::json;

    const ID: &str = "life@example.com";

    fn services(collaborators: NoopCollaborators) -> Arc<RuntimeServices> {
        Arc::new(RuntimeServices::in_memory(RuntimeConfig::default()).with_collaborators(collaborators))
    }

    fn data(manifest: serde_json::Value) -> (AddonData, MemoryPackage) {
        let package = MemoryPackage::new().with_manifest(&manifest);
        let version = manifest["version"].as_str().unwrap_or("1.0").to_string();
        (AddonData::new(ID, &version, Arc::new(package.clone())), package)
    }

    fn basic() -> serde_json::Value {
        json!({
            "manifest_version": 2,
            "name": "Life",
            "version": "1.0",
            "permissions": ["storage", "unlimitedStorage"],
            "optional_permissions": ["bookmarks"]
        })
    }

    #[test]
    fn test_phase_tracker_is_monotonic() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(LifecyclePhase::LoadingManifest).unwrap();
        assert!(tracker.advance(LifecyclePhase::NotStarted).is_err());
        tracker.advance(LifecyclePhase::Running).unwrap();
        tracker.fail("boom").unwrap();
        assert!(matches!(
            tracker.advance(LifecyclePhase::ShuttingDown),
            Err(ExtensionError::InvalidTransition { .. })
        ));
        assert!(tracker.fail("again").is_err());
    }

    #[test]
    fn test_reason_predicates() {
        assert!(BootstrapReason::AddonUpgrade.clears_caches());
        assert!(!BootstrapReason::AppStartup.clears_caches());
        assert!(!BootstrapReason::AppStartup.backfills_storage());
        assert!(BootstrapReason::AddonEnable.backfills_storage());
        assert_eq!(BootstrapReason::AddonInstall.to_string(), "ADDON_INSTALL");
    }

    #[tokio::test]
    async fn test_signal_cancels_pending_future() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.until_cancelled(std::future::pending::<()>()).await })
        };
        tokio::task::yield_now().await;
        signal.trigger();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(signal.until_cancelled(async { 1 }).await, None);
    }

    #[tokio::test]
    async fn test_startup_publishes_and_runs() {
        let noop = NoopCollaborators::new();
        let services = services(noop.clone());
        let (data, _) = data(basic());
        let mut ext = Extension::new(data, services.clone());
        let mut events = services.events.subscribe();

        ext.startup(BootstrapReason::AddonInstall).await.unwrap();
        assert_eq!(ext.phase(), &LifecyclePhase::Running);
        assert!(services.registry.is_active(ID));

        let published = services.propagator.published(ID).unwrap();
        assert_eq!(&published, ext.descriptor().unwrap());
        assert!(published.has_permission("storage"));

        assert_eq!(events.recv().await.unwrap(), ManagementEvent::Startup { id: ID.into() });
        assert_eq!(events.recv().await.unwrap(), ManagementEvent::Ready { id: ID.into() });

        let calls = noop.calls();
        assert!(calls.contains(&CollaboratorCall::ClearCaches(ID.into())));
        assert!(calls.contains(&CollaboratorCall::GrantPersistentStorage(ID.into())));
        assert!(calls.contains(&CollaboratorCall::RegisterContentScripts(ID.into())));
    }

    #[tokio::test]
    async fn test_app_startup_skips_backfill_and_cache_clear() {
        let noop = NoopCollaborators::new();
        let (data, _) = data(basic());
        let mut ext = Extension::new(data, services(noop.clone()));
        ext.startup(BootstrapReason::AppStartup).await.unwrap();

        let calls = noop.calls();
        assert!(!calls.contains(&CollaboratorCall::ClearCaches(ID.into())));
        assert!(!calls.contains(&CollaboratorCall::GrantPersistentStorage(ID.into())));
    }

    #[tokio::test]
    async fn test_failed_startup_cleans_up() {
        let services = services(NoopCollaborators::new());
        let (data, package) = data(json!({"manifest_version": 2, "version": "1.0"}));
        let mut ext = Extension::new(data, services.clone());

        let err = ext.startup(BootstrapReason::AddonInstall).await.unwrap_err();
        assert!(matches!(err, ExtensionError::ManifestInvalid { .. }));
        assert!(matches!(ext.phase(), LifecyclePhase::Errored(_)));
        assert!(package.is_released());
        assert!(services.propagator.pending(ID).is_none());
        assert!(services.cache.is_empty());
        assert!(ext.startup(BootstrapReason::AddonInstall).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_startup_aborts() {
        let services = services(NoopCollaborators::new());
        let (data, _) = data(basic());
        let mut ext = Extension::new(data, services.clone());
        ext.shutdown_signal().trigger();

        let err = ext.startup(BootstrapReason::AppStartup).await.unwrap_err();
        assert!(matches!(err, ExtensionError::StartupAborted(_)));
        assert!(services.propagator.published(ID).is_none());
        assert!(services.registry.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_permission_changes() {
        let services = services(NoopCollaborators::new());
        let (data, _) = data(basic());
        let mut ext = Extension::new(data, services.clone());
        ext.startup(BootstrapReason::AddonInstall).await.unwrap();

        let mut context = services.propagator.hub().connect().await;
        let bookmarks = PermissionSet::from_parts(["bookmarks"], [], []);
        let reader = tokio::spawn(async move {
            let envelope = context.recv().await.unwrap();
            let message = envelope.message.clone();
            envelope.ack();
            (message, context.descriptor(ID).unwrap())
        });

        services
            .settings
            .set(ID, "bookmarks", "folder", json!("toolbar"))
            .unwrap();
        ext.add_permissions(&bookmarks).await.unwrap();
        let (message, seen) = reader.await.unwrap();
        assert_eq!(
            message,
            BroadcastMessage::UpdatePermissions {
                id: ID.into(),
                delta: bookmarks.clone(),
                added: true
            }
        );
        // Published before the notification went out.
        assert!(seen.has_permission("bookmarks"));

        ext.remove_permissions(&bookmarks).await.unwrap();
        assert!(!ext.descriptor().unwrap().has_permission("bookmarks"));
        assert_eq!(services.settings.get(ID, "bookmarks", "folder"), None);

        assert!(ext
            .remove_permissions(&PermissionSet::from_parts(["storage"], [], []))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_revokes_session_permissions_except_app_shutdown() {
        for (reason, revoked) in [
            (BootstrapReason::AddonDisable, true),
            (BootstrapReason::AppShutdown, false),
        ] {
            let noop = NoopCollaborators::new();
            let services = services(noop.clone());
            let (data, package) = data(basic());
            let mut ext = Extension::new(data, services.clone());
            ext.startup(BootstrapReason::AppStartup).await.unwrap();

            let report = ext.shutdown(reason).await;
            assert_eq!(report.session_permissions_revoked, revoked);
            assert_eq!(report.phase_before, LifecyclePhase::Running);
            assert_eq!(ext.phase(), &LifecyclePhase::ShutdownComplete);
            assert!(services.propagator.published(ID).is_none());
            assert!(package.is_released());
            assert_eq!(
                noop.calls()
                    .contains(&CollaboratorCall::RevokeSessionPermissions(ID.into())),
                revoked
            );
        }
    }

    #[tokio::test]
    async fn test_apply_staged_update_migrates() {
        let services = services(NoopCollaborators::new());
        let (data, _) = data(json!({
            "manifest_version": 2, "name": "Life", "version": "1.0",
            "permissions": ["tabs", "history"]
        }));
        let mut ext = Extension::new(data, services.clone());
        ext.startup(BootstrapReason::AddonInstall).await.unwrap();

        let (next, _) = self::data(json!({
            "manifest_version": 2, "name": "Life", "version": "2.0",
            "permissions": ["tabs"],
            "optional_permissions": ["history"]
        }));
        ext.apply_staged_update(next).await.unwrap();

        let manager = ext.permission_manager().unwrap();
        assert!(manager.granted().permissions.contains("history"));
        assert_eq!(services.propagator.published(ID).unwrap().version, "2.0");
        assert_eq!(ext.data().version, "2.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_restart_checks_cached_grants() {
        let services = services(NoopCollaborators::new());
        let (first, package) = data(basic());
        let bookmarks = PermissionSet::from_parts(["bookmarks"], [], []);
        let key = CacheKey::new(ID, "1.0", "en-US");

        let mut ext = Extension::new(first, services.clone());
        ext.startup(BootstrapReason::AddonInstall).await.unwrap();
        ext.add_permissions(&bookmarks).await.unwrap();
        ext.shutdown(BootstrapReason::AppShutdown).await;

        let restart = || AddonData::new(ID, "1.0", Arc::new(package.clone()));
        let mut ext = Extension::new(restart(), services.clone());
        ext.startup(BootstrapReason::AppStartup).await.unwrap();
        assert_eq!(services.cache.hits(), 1);
        assert!(ext.descriptor().unwrap().has_permission("bookmarks"));
        assert_eq!(services.cache.get(&key).unwrap().granted, ext.permissions());
        ext.shutdown(BootstrapReason::AppShutdown).await;

        // A stale cached set loses to the grant store.
        services
            .permission_store
            .save(ID, &PermissionSet::default())
            .await
            .unwrap();
        let mut ext = Extension::new(restart(), services.clone());
        ext.startup(BootstrapReason::AppStartup).await.unwrap();
        assert_eq!(services.cache.hits(), 2);
        assert!(!ext.descriptor().unwrap().has_permission("bookmarks"));
        assert_eq!(services.cache.get(&key).unwrap().granted, ext.permissions());
    }

    #[tokio::test]
    async fn test_staged_update_completes_when_settings_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let services = Arc::new(
            RuntimeServices::in_memory(RuntimeConfig::default())
                .with_collaborators(NoopCollaborators::new())
                .with_settings(SettingsStore::new(dir.path())),
        );
        let (first, _) = data(basic());
        let mut ext = Extension::new(first, services.clone());
        ext.startup(BootstrapReason::AddonInstall).await.unwrap();
        ext.add_permissions(&PermissionSet::from_parts(["bookmarks"], [], []))
            .await
            .unwrap();
        services
            .settings
            .set(ID, "bookmarks", "folder", json!("toolbar"))
            .unwrap();

        // A directory in place of the settings file makes the next write fail.
        let file = dir.path().join(format!("{}.json", ID));
        std::fs::remove_file(&file).unwrap();
        std::fs::create_dir(&file).unwrap();

        let (next, _) = self::data(json!({
            "manifest_version": 2, "name": "Life", "version": "2.0",
            "permissions": ["storage", "unlimitedStorage"]
        }));
        ext.apply_staged_update(next).await.unwrap();

        let manager = ext.permission_manager().unwrap();
        assert!(!manager.granted().permissions.contains("bookmarks"));
        assert!(manager.active().is_covered_by(&manager.declared().declared()));
        assert_eq!(ext.data().version, "2.0");
        assert_eq!(ext.manifest().unwrap().version, "2.0");
        let published = services.propagator.published(ID).unwrap();
        assert_eq!(published.version, "2.0");
        assert!(!published.has_permission("bookmarks"));
    }

    #[tokio::test]
    async fn test_staged_downgrade_revokes_dropped_optional() {
        let services = services(NoopCollaborators::new());
        let (newer, _) = data(json!({
            "manifest_version": 2, "name": "Life", "version": "2.0",
            "permissions": ["storage"],
            "optional_permissions": ["bookmarks"]
        }));
        let mut ext = Extension::new(newer, services.clone());
        ext.startup(BootstrapReason::AddonInstall).await.unwrap();
        let bookmarks = PermissionSet::from_parts(["bookmarks"], [], []);
        ext.add_permissions(&bookmarks).await.unwrap();
        services
            .settings
            .set(ID, "bookmarks", "folder", json!("toolbar"))
            .unwrap();
        let mut events = services.events.subscribe();

        let (older, _) = self::data(json!({
            "manifest_version": 2, "name": "Life", "version": "1.0",
            "permissions": ["storage"]
        }));
        ext.apply_staged_update(older).await.unwrap();

        let manager = ext.permission_manager().unwrap();
        assert!(!manager.active().contains_permission("bookmarks"));
        assert!(manager.active().is_covered_by(&manager.declared().declared()));
        assert!(services.permission_store.load(ID).await.unwrap().is_empty());
        assert_eq!(services.settings.get(ID, "bookmarks", "folder"), None);
        assert_eq!(
            events.recv().await.unwrap(),
            ManagementEvent::PermissionsChanged {
                id: ID.into(),
                added: PermissionSet::default(),
                removed: bookmarks,
            }
        );
    }

    #[tokio::test]
    async fn test_localized_name_warning_is_kept() {
        let long_name = "n".repeat(MAX_NAME_LENGTH + 10);
        let package = MemoryPackage::new()
            .with_manifest(&json!({
                "manifest_version": 2,
                "name": "__MSG_extName__",
                "version": "1.0",
                "default_locale": "en"
            }))
            .with_file(
                "_locales/en/messages.json",
                &json!({"extName": {"message": long_name}}).to_string(),
            );
        let mut ext = Extension::new(
            AddonData::new(ID, "1.0", Arc::new(package)),
            services(NoopCollaborators::new()),
        );
        ext.startup(BootstrapReason::AddonInstall).await.unwrap();

        assert_eq!(ext.manifest().unwrap().name.chars().count(), MAX_NAME_LENGTH);
        assert!(ext.warnings().iter().any(|w| w.contains("truncated")));
    }

    #[tokio::test]
    async fn test_permission_broadcast_outcome_is_reported() {
        let services = services(NoopCollaborators::new());
        let (first, _) = data(basic());
        let mut ext = Extension::new(first, services.clone());
        ext.startup(BootstrapReason::AddonInstall).await.unwrap();

        let hub = services.propagator.hub();
        let listener = hub.connect().await.spawn_auto_ack();
        drop(hub.connect().await);
        let bookmarks = PermissionSet::from_parts(["bookmarks"], [], []);
        let outcome = ext.notify_permissions(&bookmarks, true).await.unwrap();
        assert_eq!(outcome.acknowledged.len(), 1);
        assert_eq!(outcome.disconnected.len(), 1);

        ext.shutdown_signal().trigger();
        assert!(ext.notify_permissions(&bookmarks, true).await.is_none());
        listener.abort();
    }
}
