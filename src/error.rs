//! Error types for webext-host
//!
//! Crate-level errors for configuration and the command line. The extension
//! subsystem has its own [`crate::extensions::ExtensionError`].

use thiserror::Error;

use crate::extensions::ExtensionError;

/// Errors that can occur outside the extension subsystem
#[derive(Debug, Error)]
pub enum HostError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Extension loading or lifecycle errors
    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("Config serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Result type alias for host operations
pub type HostResult<T> = Result<T, HostError>;
