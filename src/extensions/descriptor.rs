//! The serialised snapshot of a running extension.
//!
//! A descriptor is derived from the localized manifest and the active
//! permission set and is never edited after it is built. A change in either
//! input produces a new descriptor.

use serde::{Deserialize, Serialize};

use super::error::ExtensionResult;
use super::manifest::{AddonType, ContentScript, NormalizedManifest, WebAccessibleResource};
use super::match_pattern::MatchPatternSet;
use super::permissions::PermissionSet;

/// Install-time facts carried into every descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorFlags {
    pub is_privileged: bool,
    pub ignore_quarantine: bool,
    pub temporarily_installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Host-specific identifier, also the hostname of `base_url`.
    pub uuid: String,
    #[serde(rename = "type")]
    pub addon_type: AddonType,
    pub manifest_version: u8,
    pub content_security_policy: String,
    pub content_scripts: Vec<ContentScript>,
    pub web_accessible_resources: Vec<WebAccessibleResource>,
    pub allowed_origins: Vec<String>,
    pub permissions: Vec<String>,
    pub data_collection: Vec<String>,
    pub is_privileged: bool,
    pub ignore_quarantine: bool,
    pub temporarily_installed: bool,
    pub base_url: String,
}

impl ExtensionDescriptor {
    pub fn build(
        manifest: &NormalizedManifest,
        active: &PermissionSet,
        uuid: &str,
        flags: DescriptorFlags,
    ) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            uuid: uuid.to_string(),
            addon_type: manifest.addon_type,
            manifest_version: manifest.manifest_version,
            content_security_policy: manifest.content_security_policy.clone(),
            content_scripts: manifest.content_scripts.clone(),
            web_accessible_resources: manifest.web_accessible_resources.clone(),
            allowed_origins: active.origins.iter().cloned().collect(),
            permissions: active.permissions.iter().cloned().collect(),
            data_collection: active.data_collection.iter().cloned().collect(),
            is_privileged: flags.is_privileged,
            ignore_quarantine: flags.ignore_quarantine,
            temporarily_installed: flags.temporarily_installed,
            base_url: format!("moz-extension://{}/", uuid),
        }
    }

    pub fn to_bytes(&self) -> ExtensionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ExtensionResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Whether the extension has host access to `url`.
    pub fn allows_url(&self, url: &str) -> bool {
        MatchPatternSet::from_strings(&self.allowed_origins, !self.is_privileged).matches_url(url)
    }
}
