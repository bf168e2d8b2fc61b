//! `webext-host validate`.

use anyhow::{bail, Context, Result};

use crate::config::RuntimeConfig;
use crate::extensions::classifier::PermissionClassifier;
use crate::extensions::manifest::ManifestContext;
use crate::extensions::manifest_cache::CachedManifest;
use crate::extensions::{load_manifest, DirectoryPackage, ExtensionError};

use super::PackageArgs;

pub(crate) fn context(args: &PackageArgs, config: &RuntimeConfig) -> ManifestContext {
    ManifestContext {
        id: args.id.clone(),
        temporarily_installed: args.temporary,
        is_privileged: args.privileged,
        flags: config.features,
    }
}

/// Load and classify the manifest at `args.path`.
pub(crate) async fn load(args: &PackageArgs, config: &RuntimeConfig) -> Result<CachedManifest> {
    let root = args
        .path
        .canonicalize()
        .with_context(|| format!("Extension directory not found: {}", args.path.display()))?;
    let package = DirectoryPackage::new(root);
    let classifier = PermissionClassifier::new(config.features);
    Ok(load_manifest(&package, &context(args, config), &classifier).await?)
}

pub async fn run_validate(args: &PackageArgs, config: &RuntimeConfig) -> Result<()> {
    let cached = match load(args, config).await {
        Ok(cached) => cached,
        Err(e) => {
            if let Some(ExtensionError::ManifestInvalid { id, errors }) = e.downcast_ref::<ExtensionError>() {
                for error in errors {
                    println!("error: {}", error);
                }
                bail!("manifest for '{}' is invalid ({} errors)", id, errors.len());
            }
            return Err(e);
        }
    };

    let manifest = &cached.manifest;
    for warning in manifest.warnings.iter().chain(&cached.permissions.warnings) {
        println!("warning: {}", warning);
    }

    let required = cached.permissions.required_permissions();
    let optional = cached.permissions.optional_permissions();
    println!(
        "ok: {} {} (manifest v{}, {:?})",
        manifest.id, manifest.version, manifest.manifest_version, manifest.addon_type
    );
    println!("  required: {}", required.names().join(", "));
    println!("  optional: {}", optional.names().join(", "));
    Ok(())
}
