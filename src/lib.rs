//! webext-host - WebExtension lifecycle runtime.
//!
//! Loads extension packages, validates their manifests, computes and
//! persists their permissions, and publishes a consistent descriptor of each
//! running extension to other execution contexts.
//!
//! # Architecture
//!
//! The library is organized into these main modules:
//!
//! - [`config`] - Runtime configuration loading and management
//! - [`extensions`] - Manifests, permissions, lifecycle and shared state
//! - [`cli`] - Developer commands (`validate`, `describe`)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use webext_host::extensions::{AddonBootstrap, AddonData, BootstrapReason, DirectoryPackage};
//! use webext_host::{RuntimeConfig, RuntimeServices};
//!
//! let services = Arc::new(RuntimeServices::from_config(RuntimeConfig::load()));
//! let bootstrap = AddonBootstrap::new(services);
//! let package = Arc::new(DirectoryPackage::new("path/to/extension"));
//! bootstrap
//!     .startup(AddonData::new("ext@example.com", "1.0", package), BootstrapReason::AppStartup)
//!     .await?;
//! ```

pub mod cli;
pub mod config;
pub mod extensions;

mod error;

pub use config::RuntimeConfig;
pub use error::{HostError, HostResult};
pub use extensions::RuntimeServices;
