use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HostError, HostResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub features: FeatureFlags,
    pub lifecycle: LifecycleConfig,
    pub locale: LocaleConfig,
    pub storage: StorageConfig,
}

/// Runtime feature flags that gate individual permissions and manifest keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub dnr_enabled: bool,
    pub user_scripts_mv3_enabled: bool,
    /// Lets temporarily installed, unprivileged add-ons use `experiment_apis`.
    pub experiments_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long shutdown waits for remote contexts to acknowledge.
    pub shutdown_ack_timeout_ms: u64,
    /// Overall shutdown budget, bounds the wait for storage migrations.
    pub shutdown_budget_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocaleConfig {
    /// Preferred UI locales, most preferred first.
    pub preferred: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            dnr_enabled: true,
            user_scripts_mv3_enabled: false,
            experiments_enabled: false,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_ack_timeout_ms: 8000,
            shutdown_budget_ms: 30_000,
        }
    }
}

impl Default for LocaleConfig {
    fn default() -> Self {
        Self {
            preferred: vec!["en-US".to_string()],
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_ack_timeout_ms)
    }

    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_budget_ms)
    }
}

impl LocaleConfig {
    /// The app locale used in manifest cache keys.
    pub fn app_locale(&self) -> &str {
        self.preferred.first().map(String::as_str).unwrap_or("en-US")
    }
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("webext-host"))
                .unwrap_or_else(|| PathBuf::from(".webext-host"))
        })
    }

    pub fn permissions_path(&self) -> PathBuf {
        self.data_dir().join("permissions.json")
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.data_dir().join("settings")
    }
}

impl RuntimeConfig {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("webext-host")
            .join("config.toml")
    }

    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> HostResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        if let Some(dir) = config.storage.data_dir.as_ref().filter(|d| d.is_relative()) {
            return Err(HostError::Config(format!(
                "storage.data_dir must be an absolute path, got {}",
                dir.display()
            )));
        }
        config.validate();
        Ok(config)
    }

    /// Clamp values to acceptable ranges
    fn validate(&mut self) {
        // An ack timeout longer than the whole budget makes no sense.
        self.lifecycle.shutdown_ack_timeout_ms = self
            .lifecycle
            .shutdown_ack_timeout_ms
            .min(self.lifecycle.shutdown_budget_ms);

        if self.locale.preferred.is_empty() {
            self.locale.preferred = LocaleConfig::default().preferred;
        }
    }

    pub fn save_to(&self, path: &Path) -> HostResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
