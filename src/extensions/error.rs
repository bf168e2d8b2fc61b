//! Error types for the extension subsystem.

use thiserror::Error;

use super::lifecycle::LifecyclePhase;
use super::permission_store::StorageError;

/// Errors that can occur while loading or running an extension.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// The package could not be read, or its manifest is not valid JSON.
    #[error("Invalid extension package {location}: {message}")]
    Packaging { location: String, message: String },

    /// One or more fatal manifest validation errors.
    #[error("Invalid manifest for '{id}': {}", .errors.join("; "))]
    ManifestInvalid { id: String, errors: Vec<String> },

    #[error("Permission '{permission}' is not declared as optional by '{extension}'")]
    PermissionNotDeclared {
        extension: String,
        permission: String,
    },

    #[error("Cannot remove required permission '{permission}' from '{extension}'")]
    CannotRemoveRequired {
        extension: String,
        permission: String,
    },

    #[error("Operation requires phase {expected}, extension is {actual}")]
    InvalidPhase {
        expected: &'static str,
        actual: LifecyclePhase,
    },

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("Startup of '{0}' aborted by shutdown")]
    StartupAborted(String),

    #[error("Manifest entry '{key}' failed to initialize: {message}")]
    EntryInitializer { key: String, message: String },

    #[error("Extension '{0}' is already started")]
    AlreadyStarted(String),

    #[error("Extension '{0}' not found")]
    ExtensionNotFound(String),

    #[error("Permission storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for extension operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;
