//! WebExtension lifecycle runtime.
//!
//! # Architecture
//!
//! ```text
//! AddonBootstrap
//! └── addons: HashMap<ExtensionId, AddonHandle>
//!     └── AddonInstance (Extension | Dictionary | Langpack)
//!
//! RuntimeServices (one per process)
//! ├── classifier: PermissionClassifier
//! ├── cache: ManifestCache          (id, version, locale) -> parsed manifest
//! ├── permission_store              persisted optional grants
//! ├── settings: SettingsStore       settings owned by a permission
//! ├── propagator: SharedStatePropagator
//! │   ├── pending / published descriptor registries
//! │   └── ContextHub -> RemoteContext (acknowledged broadcasts)
//! ├── events: EventBus
//! ├── registry: ExtensionRegistry
//! └── collaborators (storage, content scripts, site permissions)
//! ```
//!
//! An extension starts by loading its manifest (through the cache),
//! negotiating a locale, reconciling its permissions against the grant
//! store, and publishing an [`ExtensionDescriptor`] to the pending registry.
//! Manifest entry initializers then run concurrently. Once they have all
//! finished, the descriptor is promoted, remote contexts are told, and the
//! extension is `Running`.

pub mod bootstrap;
pub mod classifier;
pub mod collaborators;
pub mod descriptor;
mod error;
pub mod events;
pub mod json_comments;
pub mod kinds;
pub mod lifecycle;
pub mod locale;
pub mod manifest;
pub mod manifest_cache;
pub mod match_pattern;
pub mod package;
pub mod permission_manager;
pub mod permission_store;
pub mod permissions;
pub mod prompt;
pub mod registry;
pub mod settings;
pub mod shared_state;

pub use bootstrap::{AddonBootstrap, AddonState, BootstrapState};
pub use classifier::{Classification, PermissionClassifier};
pub use descriptor::ExtensionDescriptor;
pub use error::{ExtensionError, ExtensionResult};
pub use events::{EventBus, ManagementEvent};
pub use kinds::{load_manifest, AddonInstance, Dictionary, Langpack, ManifestOwner};
pub use lifecycle::{
    AddonData, BootstrapReason, Extension, LifecyclePhase, ShutdownReport, ShutdownSignal,
};
pub use manifest::{normalize, AddonType, ManifestContext, NormalizedManifest};
pub use package::{DirectoryPackage, ExtensionPackage, MemoryPackage};
pub use permission_manager::PermissionSetManager;
pub use permission_store::{JsonFilePermissionStore, MemoryPermissionStore, PermissionStore};
pub use permissions::{ManifestPermissions, PermissionSet};
pub use prompt::{format_permission_strings, EnglishStrings, PermissionStrings, PromptKind};
pub use registry::RuntimeServices;
pub use shared_state::{BroadcastMessage, SharedStatePropagator};
