//! Add-on kinds that own a manifest.
//!
//! Extensions and themes run the full lifecycle in [`Extension`]. Dictionaries
//! and langpacks only need their manifest loaded and their package checked,
//! so they share the loading step in [`load_manifest`] but nothing else.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::classifier::PermissionClassifier;
use super::error::{ExtensionError, ExtensionResult};
use super::lifecycle::{
    AddonData, BootstrapReason, Extension, LifecyclePhase, PhaseTracker, ShutdownReport,
    ShutdownSignal,
};
use super::manifest::{parse_manifest_text, AddonType, ManifestContext, NormalizedManifest};
use super::manifest_cache::{CacheKey, CachedManifest};
use super::package::{ExtensionPackage, MANIFEST_FILE};
use super::permissions::ManifestPermissions;
use super::registry::RuntimeServices;

/// Read, validate and classify a package's manifest.
pub async fn load_manifest(
    package: &dyn ExtensionPackage,
    ctx: &ManifestContext,
    classifier: &PermissionClassifier,
) -> ExtensionResult<CachedManifest> {
    let location = package.location();
    let text = package.read_text(MANIFEST_FILE).await?;
    let manifest = parse_manifest_text(&text, &location, ctx)?;

    let permissions = ManifestPermissions::from_manifest(&manifest, classifier, ctx);
    if permissions.has_errors() {
        return Err(ExtensionError::ManifestInvalid {
            id: manifest.id.clone(),
            errors: permissions.errors.clone(),
        });
    }
    for warning in &permissions.warnings {
        tracing::warn!(extension_id = %manifest.id, "permission warning: {}", warning);
    }
    tracing::debug!(extension_id = %manifest.id, %location, "loaded manifest");
    Ok(CachedManifest::new(manifest, permissions))
}

/// Anything built from a manifest and driven by bootstrap hooks.
#[async_trait]
pub trait ManifestOwner: Send {
    fn id(&self) -> &str;

    fn addon_type(&self) -> AddonType;

    fn phase(&self) -> &LifecyclePhase;

    fn manifest(&self) -> Option<&NormalizedManifest>;

    async fn startup(&mut self, reason: BootstrapReason) -> ExtensionResult<()>;

    async fn shutdown(&mut self, reason: BootstrapReason) -> ShutdownReport;
}

#[async_trait]
impl ManifestOwner for Extension {
    fn id(&self) -> &str {
        Extension::id(self)
    }

    fn addon_type(&self) -> AddonType {
        self.manifest()
            .map(|m| m.addon_type)
            .unwrap_or(self.data().addon_type)
    }

    fn phase(&self) -> &LifecyclePhase {
        Extension::phase(self)
    }

    fn manifest(&self) -> Option<&NormalizedManifest> {
        Extension::manifest(self)
    }

    async fn startup(&mut self, reason: BootstrapReason) -> ExtensionResult<()> {
        Extension::startup(self, reason).await
    }

    async fn shutdown(&mut self, reason: BootstrapReason) -> ShutdownReport {
        Extension::shutdown(self, reason).await
    }
}

/// Manifest loading shared by the passive kinds.
struct PassiveAddon {
    data: AddonData,
    services: Arc<RuntimeServices>,
    phase: PhaseTracker,
    signal: ShutdownSignal,
    manifest: Option<Arc<NormalizedManifest>>,
}

impl PassiveAddon {
    fn new(data: AddonData, services: Arc<RuntimeServices>, signal: ShutdownSignal) -> Self {
        Self {
            data,
            services,
            phase: PhaseTracker::new(),
            signal,
            manifest: None,
        }
    }

    async fn load(&mut self, reason: BootstrapReason, expected: AddonType) -> ExtensionResult<Arc<NormalizedManifest>> {
        if *self.phase.current() != LifecyclePhase::NotStarted {
            return Err(ExtensionError::InvalidPhase {
                expected: "NotStarted",
                actual: self.phase.current().clone(),
            });
        }
        self.phase.advance(LifecyclePhase::LoadingManifest)?;

        let services = self.services.clone();
        if reason.clears_caches() {
            services.cache.invalidate(&self.data.id);
        }
        let ctx = self.data.manifest_context(&services);
        let key = CacheKey::new(
            &self.data.id,
            &self.data.version,
            services.config.locale.app_locale(),
        );
        let package = self.data.package.clone();
        let classifier = services.classifier;
        let cached = self
            .signal
            .until_cancelled(
                services
                    .cache
                    .get_or_compute(key, || load_manifest(package.as_ref(), &ctx, &classifier)),
            )
            .await
            .ok_or_else(|| ExtensionError::StartupAborted(self.data.id.clone()))??;

        if cached.manifest.addon_type != expected {
            return Err(ExtensionError::ManifestInvalid {
                id: self.data.id.clone(),
                errors: vec![format!(
                    "expected a {:?} manifest, found {:?}",
                    expected, cached.manifest.addon_type
                )],
            });
        }
        Ok(cached.manifest)
    }

    async fn fail(&mut self, error: &ExtensionError) {
        tracing::error!(extension_id = %self.data.id, error = %error, "startup failed");
        self.services.cache.invalidate(&self.data.id);
        self.data.package.release().await;
        let _ = self.phase.fail(error.to_string());
    }

    fn running(&mut self, manifest: Arc<NormalizedManifest>) -> ExtensionResult<()> {
        self.manifest = Some(manifest);
        self.phase.advance(LifecyclePhase::Running)?;
        tracing::info!(extension_id = %self.data.id, "add-on running");
        Ok(())
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        self.signal.trigger();
        let phase_before = self.phase.current().clone();
        if !phase_before.is_terminal() {
            let _ = self.phase.advance(LifecyclePhase::ShuttingDown);
            self.data.package.release().await;
            let _ = self.phase.advance(LifecyclePhase::ShutdownComplete);
        }
        ShutdownReport {
            phase_before,
            broadcast: None,
            migration_settled: true,
            session_permissions_revoked: false,
        }
    }
}

/// A spell-checking dictionary add-on.
pub struct Dictionary {
    inner: PassiveAddon,
    /// Language tag to `.dic` path.
    dictionaries: BTreeMap<String, String>,
}

impl Dictionary {
    pub fn new(data: AddonData, services: Arc<RuntimeServices>, signal: ShutdownSignal) -> Self {
        Self {
            inner: PassiveAddon::new(data, services, signal),
            dictionaries: BTreeMap::new(),
        }
    }

    pub fn dictionaries(&self) -> &BTreeMap<String, String> {
        &self.dictionaries
    }

    async fn start(&mut self, reason: BootstrapReason) -> ExtensionResult<()> {
        let manifest = self.inner.load(reason, AddonType::Dictionary).await?;

        let package = self.inner.data.package.clone();
        let mut missing = Vec::new();
        for path in manifest.dictionaries.values() {
            let affix = format!("{}.aff", path.trim_end_matches(".dic"));
            for file in [path.as_str(), affix.as_str()] {
                if !package.exists(file).await {
                    missing.push(format!("dictionary file '{}' is missing", file));
                }
            }
        }
        if !missing.is_empty() {
            return Err(ExtensionError::ManifestInvalid {
                id: self.inner.data.id.clone(),
                errors: missing,
            });
        }

        self.dictionaries = manifest.dictionaries.clone();
        self.inner.running(manifest)
    }
}

#[async_trait]
impl ManifestOwner for Dictionary {
    fn id(&self) -> &str {
        &self.inner.data.id
    }

    fn addon_type(&self) -> AddonType {
        AddonType::Dictionary
    }

    fn phase(&self) -> &LifecyclePhase {
        self.inner.phase.current()
    }

    fn manifest(&self) -> Option<&NormalizedManifest> {
        self.inner.manifest.as_deref()
    }

    async fn startup(&mut self, reason: BootstrapReason) -> ExtensionResult<()> {
        if let Err(e) = self.start(reason).await {
            self.inner.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&mut self, _reason: BootstrapReason) -> ShutdownReport {
        self.dictionaries.clear();
        self.inner.shutdown().await
    }
}

/// A language pack.
pub struct Langpack {
    inner: PassiveAddon,
    languages: Vec<String>,
}

impl Langpack {
    pub fn new(data: AddonData, services: Arc<RuntimeServices>, signal: ShutdownSignal) -> Self {
        Self {
            inner: PassiveAddon::new(data, services, signal),
            languages: Vec::new(),
        }
    }

    /// Language tags the pack provides.
    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    async fn start(&mut self, reason: BootstrapReason) -> ExtensionResult<()> {
        let manifest = self.inner.load(reason, AddonType::Locale).await?;
        let Some(langpack) = &manifest.langpack else {
            return Err(ExtensionError::ManifestInvalid {
                id: self.inner.data.id.clone(),
                errors: vec!["langpack manifest has no 'langpack_id'".to_string()],
            });
        };
        self.languages = langpack.languages.keys().cloned().collect();
        self.inner.running(manifest)
    }
}

#[async_trait]
impl ManifestOwner for Langpack {
    fn id(&self) -> &str {
        &self.inner.data.id
    }

    fn addon_type(&self) -> AddonType {
        AddonType::Locale
    }

    fn phase(&self) -> &LifecyclePhase {
        self.inner.phase.current()
    }

    fn manifest(&self) -> Option<&NormalizedManifest> {
        self.inner.manifest.as_deref()
    }

    async fn startup(&mut self, reason: BootstrapReason) -> ExtensionResult<()> {
        if let Err(e) = self.start(reason).await {
            self.inner.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&mut self, _reason: BootstrapReason) -> ShutdownReport {
        self.languages.clear();
        self.inner.shutdown().await
    }
}

/// One add-on instance of whatever kind its data declares.
pub enum AddonInstance {
    Extension(Extension),
    Dictionary(Dictionary),
    Langpack(Langpack),
}

impl AddonInstance {
    pub fn new(data: AddonData, services: Arc<RuntimeServices>, signal: ShutdownSignal) -> Self {
        match data.addon_type {
            AddonType::Extension | AddonType::Theme => {
                AddonInstance::Extension(Extension::with_signal(data, services, signal))
            }
            AddonType::Dictionary => AddonInstance::Dictionary(Dictionary::new(data, services, signal)),
            AddonType::Locale => AddonInstance::Langpack(Langpack::new(data, services, signal)),
        }
    }

    pub fn owner(&self) -> &dyn ManifestOwner {
        match self {
            AddonInstance::Extension(e) => e,
            AddonInstance::Dictionary(d) => d,
            AddonInstance::Langpack(l) => l,
        }
    }

    pub fn owner_mut(&mut self) -> &mut dyn ManifestOwner {
        match self {
            AddonInstance::Extension(e) => e,
            AddonInstance::Dictionary(d) => d,
            AddonInstance::Langpack(l) => l,
        }
    }

    pub fn as_extension(&self) -> Option<&Extension> {
        match self {
            AddonInstance::Extension(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_extension_mut(&mut self) -> Option<&mut Extension> {
        match self {
            AddonInstance::Extension(e) => Some(e),
            _ => None,
        }
    }
}
