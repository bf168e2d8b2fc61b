//! `webext-host describe`.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::RuntimeConfig;
use crate::extensions::{AddonBootstrap, AddonData, BootstrapReason, DirectoryPackage, RuntimeServices};

use super::validate;
use super::PackageArgs;

pub async fn run_describe(args: &PackageArgs, config: RuntimeConfig) -> Result<()> {
    // Resolves the id when the manifest does not carry one.
    let cached = validate::load(args, &config).await?;
    let manifest = &cached.manifest;

    let root = args.path.canonicalize()?;
    let mut data = AddonData::new(&manifest.id, &manifest.version, Arc::new(DirectoryPackage::new(root)));
    data.addon_type = manifest.addon_type;
    data.is_privileged = args.privileged;
    data.temporarily_installed = args.temporary;

    let services = Arc::new(RuntimeServices::in_memory(config));
    let bootstrap = AddonBootstrap::new(services.clone());
    bootstrap.install(&data).await?;
    bootstrap
        .startup(data, BootstrapReason::AddonInstall)
        .await
        .with_context(|| format!("Failed to start {}", manifest.id))?;

    let descriptor = services
        .propagator
        .published(&manifest.id)
        .context("Extension did not publish a descriptor")?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);

    bootstrap
        .shutdown(&manifest.id, BootstrapReason::AppShutdown)
        .await?;
    Ok(())
}
