//! Permission sets for extensions.
//!
//! This module provides:
//! - `PermissionSet` - named permissions, host origins, and data collection categories
//! - `ManifestPermissions` - what a manifest declares as required and optional
//! - `compare_permissions` - what an update adds that the user has not seen

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::classifier::{Classification, PermissionClassifier};
use super::manifest::{AddonType, ManifestContext, NormalizedManifest, DATA_COLLECTION_NONE};
use super::match_pattern::{MatchPattern, MatchPatternSet};

/// A set of permissions. Used for declarations, grants, and deltas alike.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    #[serde(default)]
    pub permissions: BTreeSet<String>,

    /// Host match patterns, normalised with paths ignored.
    #[serde(default)]
    pub origins: BTreeSet<String>,

    #[serde(default)]
    pub data_collection: BTreeSet<String>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from string slices.
    pub fn from_parts<'a>(
        permissions: impl IntoIterator<Item = &'a str>,
        origins: impl IntoIterator<Item = &'a str>,
        data_collection: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut set = Self {
            permissions: permissions.into_iter().map(str::to_string).collect(),
            origins: origins.into_iter().map(str::to_string).collect(),
            data_collection: data_collection.into_iter().map(str::to_string).collect(),
        };
        set.normalize_data_collection();
        set
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.origins.is_empty() && self.data_collection.is_empty()
    }

    /// Exact-string membership across all three kinds.
    pub fn contains_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn union(&self, other: &PermissionSet) -> PermissionSet {
        let mut out = self.clone();
        out.extend(other);
        out
    }

    pub fn extend(&mut self, other: &PermissionSet) {
        self.permissions.extend(other.permissions.iter().cloned());
        self.origins.extend(other.origins.iter().cloned());
        self.data_collection
            .extend(other.data_collection.iter().cloned());
        self.normalize_data_collection();
    }

    /// Entries of `self` not present (by exact string) in `other`.
    pub fn difference(&self, other: &PermissionSet) -> PermissionSet {
        PermissionSet {
            permissions: self
                .permissions
                .difference(&other.permissions)
                .cloned()
                .collect(),
            origins: self.origins.difference(&other.origins).cloned().collect(),
            data_collection: self
                .data_collection
                .difference(&other.data_collection)
                .cloned()
                .collect(),
        }
    }

    /// Entries present in both sets.
    pub fn intersection(&self, other: &PermissionSet) -> PermissionSet {
        PermissionSet {
            permissions: self
                .permissions
                .intersection(&other.permissions)
                .cloned()
                .collect(),
            origins: self.origins.intersection(&other.origins).cloned().collect(),
            data_collection: self
                .data_collection
                .intersection(&other.data_collection)
                .cloned()
                .collect(),
        }
    }

    pub fn remove_all(&mut self, other: &PermissionSet) {
        self.permissions.retain(|p| !other.permissions.contains(p));
        self.origins.retain(|o| !other.origins.contains(o));
        self.data_collection
            .retain(|d| !other.data_collection.contains(d));
    }

    /// `none` never co-occurs with a concrete data collection category.
    pub fn normalize_data_collection(&mut self) {
        if self.data_collection.len() > 1 {
            self.data_collection.remove(DATA_COLLECTION_NONE);
        }
    }

    /// Every permission and data category `self` holds is held by `other`,
    /// and every origin is covered by one of `other`'s origins.
    pub fn is_covered_by(&self, other: &PermissionSet) -> bool {
        self.permissions.is_subset(&other.permissions)
            && self.data_collection.is_subset(&other.data_collection)
            && self.origins.iter().all(|o| covers_origin(&other.origins, o))
    }

    /// Every permission name, origin and data category as one flat list.
    pub fn names(&self) -> Vec<String> {
        self.permissions
            .iter()
            .chain(&self.origins)
            .chain(&self.data_collection)
            .cloned()
            .collect()
    }
}

/// Whether `origin` is in `origins` by exact string or by domain
/// subsumption (scheme ignored).
pub fn covers_origin(origins: &BTreeSet<String>, origin: &str) -> bool {
    if origins.contains(origin) {
        return true;
    }
    let Ok(pattern) = MatchPattern::parse(origin, false, true) else {
        return false;
    };
    MatchPatternSet::from_strings(origins, false).subsumes_domain(&pattern)
}

/// The permission declaration of one manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestPermissions {
    pub required: PermissionSet,
    pub optional: PermissionSet,
    /// `experiments.<name>` API names.
    pub apis: BTreeSet<String>,
    /// MV3 extensions: required host permissions are user-controlled.
    pub origin_controls: bool,
    pub restrict_schemes: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ManifestPermissions {
    /// Classify every token the manifest requests.
    pub fn from_manifest(
        manifest: &NormalizedManifest,
        classifier: &PermissionClassifier,
        ctx: &ManifestContext,
    ) -> Self {
        let is_privileged = ctx.is_privileged;
        let restrict_schemes =
            !(is_privileged && manifest.permissions.iter().any(|p| p == "mozillaAddons"));

        let mut out = ManifestPermissions {
            origin_controls: manifest.manifest_version >= 3
                && manifest.addon_type == AddonType::Extension,
            restrict_schemes,
            ..Default::default()
        };

        let mv = manifest.manifest_version;
        let classify_into = |tokens: &[String], optional: bool, hosts_only: bool, out: &mut Self| {
            for token in tokens {
                let class = classifier.classify(token, restrict_schemes, is_privileged, mv);
                let target = if optional {
                    &mut out.optional
                } else {
                    &mut out.required
                };
                match class {
                    Classification::Origin(origin) => {
                        if mv >= 3 && !hosts_only {
                            out.warnings.push(format!(
                                "origin '{}' belongs in host_permissions under manifest version 3",
                                token
                            ));
                        } else {
                            target.origins.insert(origin);
                        }
                    }
                    _ if hosts_only => {
                        out.warnings
                            .push(format!("invalid host permission '{}'", token));
                    }
                    Classification::Api(name) => {
                        out.apis.insert(name);
                        target.permissions.insert(token.clone());
                    }
                    Classification::Permission(name) => {
                        target.permissions.insert(name);
                    }
                    Classification::Invalid {
                        privileged: true, ..
                    } => {
                        let message =
                            format!("permission '{}' requires a privileged add-on", token);
                        if ctx.temporarily_installed {
                            out.warnings.push(message);
                        } else {
                            out.errors.push(message);
                        }
                    }
                    Classification::Invalid { .. } => {
                        out.warnings
                            .push(format!("invalid extension permission '{}'", token));
                    }
                }
            }
        };

        classify_into(&manifest.permissions, false, false, &mut out);
        classify_into(&manifest.host_permissions, false, true, &mut out);
        classify_into(&manifest.optional_permissions, true, false, &mut out);
        classify_into(&manifest.optional_host_permissions, true, true, &mut out);

        out.required.data_collection = manifest.data_collection.required.iter().cloned().collect();
        out.optional.data_collection = manifest.data_collection.optional.iter().cloned().collect();
        out.required.normalize_data_collection();

        // Anything required is not also optional.
        let required = out.required.clone();
        out.optional.remove_all(&required);

        out
    }

    /// What must be granted for the extension to run.
    ///
    /// Under origin controls the required host permissions are left to the
    /// user and are not part of this set.
    pub fn required_permissions(&self) -> PermissionSet {
        PermissionSet {
            permissions: self.required.permissions.clone(),
            origins: if self.origin_controls {
                BTreeSet::new()
            } else {
                self.required.origins.clone()
            },
            data_collection: self.required.data_collection.clone(),
        }
    }

    /// What may be granted or revoked at runtime.
    pub fn optional_permissions(&self) -> PermissionSet {
        let mut set = self.optional.clone();
        if self.origin_controls {
            set.origins.extend(self.required.origins.iter().cloned());
        }
        set
    }

    /// Host origins listed anywhere in the required declaration.
    pub fn manifest_origins(&self) -> &BTreeSet<String> {
        &self.required.origins
    }

    /// Everything the manifest declares.
    pub fn declared(&self) -> PermissionSet {
        self.required.union(&self.optional)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Permissions in `new` that `old` does not already cover.
///
/// Origins are compared by domain subsumption with the scheme ignored, so
/// narrowing `*://*.example.com/*` to `https://example.com/*` adds nothing.
pub fn compare_permissions(old: &PermissionSet, new: &PermissionSet) -> PermissionSet {
    PermissionSet {
        permissions: new
            .permissions
            .difference(&old.permissions)
            .cloned()
            .collect(),
        origins: new
            .origins
            .iter()
            .filter(|o| !covers_origin(&old.origins, o))
            .cloned()
            .collect(),
        data_collection: new
            .data_collection
            .difference(&old.data_collection)
            .filter(|d| d.as_str() != DATA_COLLECTION_NONE)
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::extensions::manifest::normalize;
    use serde_json::json;

    fn ctx() -> ManifestContext {
        ManifestContext {
            id: Some("perm@example.com".to_string()),
            ..Default::default()
        }
    }

    fn declare(raw: serde_json::Value, ctx: &ManifestContext) -> ManifestPermissions {
        let manifest = normalize(raw, ctx).unwrap();
        ManifestPermissions::from_manifest(
            &manifest,
            &PermissionClassifier::new(FeatureFlags::default()),
            ctx,
        )
    }

    #[test]
    fn test_mv3_origin_controls() {
        let perms = declare(
            json!({
                "manifest_version": 3, "name": "T", "version": "1.0",
                "permissions": ["storage"],
                "host_permissions": ["https://example.com/*"]
            }),
            &ctx(),
        );
        assert!(perms.origin_controls);
        assert!(perms.manifest_origins().contains("https://example.com/*"));

        let required = perms.required_permissions();
        assert!(required.permissions.contains("storage"));
        assert!(required.origins.is_empty());
        assert!(perms
            .optional_permissions()
            .origins
            .contains("https://example.com/*"));
    }

    #[test]
    fn test_mv2_origins_in_permissions() {
        let perms = declare(
            json!({
                "manifest_version": 2, "name": "T", "version": "1.0",
                "permissions": ["tabs", "*://*.example.com/some/path"],
                "optional_permissions": ["tabs", "bookmarks"]
            }),
            &ctx(),
        );
        assert!(!perms.origin_controls);
        assert!(perms
            .required_permissions()
            .origins
            .contains("*://*.example.com/*"));
        // Already required, so not optional.
        assert_eq!(
            perms.optional.permissions,
            BTreeSet::from(["bookmarks".to_string()])
        );
    }

    #[test]
    fn test_mv3_origin_in_permissions_warns() {
        let perms = declare(
            json!({
                "manifest_version": 3, "name": "T", "version": "1.0",
                "permissions": ["https://example.com/*"]
            }),
            &ctx(),
        );
        assert!(perms.required.origins.is_empty());
        assert_eq!(perms.warnings.len(), 1);
    }

    #[test]
    fn test_privileged_permission_policy() {
        let raw = json!({
            "manifest_version": 2, "name": "T", "version": "1.0",
            "permissions": ["telemetry"]
        });
        assert!(declare(raw.clone(), &ctx()).has_errors());

        let temporary = ManifestContext {
            temporarily_installed: true,
            ..ctx()
        };
        let perms = declare(raw.clone(), &temporary);
        assert!(!perms.has_errors());
        assert_eq!(perms.warnings.len(), 1);

        let privileged = ManifestContext {
            is_privileged: true,
            ..ctx()
        };
        assert!(declare(raw, &privileged)
            .required
            .permissions
            .contains("telemetry"));
    }

    #[test]
    fn test_restrict_schemes() {
        let raw = json!({
            "manifest_version": 2, "name": "T", "version": "1.0",
            "permissions": ["mozillaAddons", "about://reader/"]
        });
        let privileged = ManifestContext {
            is_privileged: true,
            ..ctx()
        };
        let perms = declare(raw, &privileged);
        assert!(!perms.restrict_schemes);
        assert!(perms.required.origins.contains("about://reader/*"));
    }

    #[test]
    fn test_experiment_apis_collected() {
        let perms = declare(
            json!({
                "manifest_version": 2, "name": "T", "version": "1.0",
                "permissions": ["experiments.sync"]
            }),
            &ctx(),
        );
        assert!(perms.apis.contains("sync"));
    }

    #[test]
    fn test_data_collection_none_dropped() {
        let mut set = PermissionSet::from_parts([], [], ["none"]);
        assert!(set.data_collection.contains("none"));
        set.extend(&PermissionSet::from_parts([], [], ["locationInfo"]));
        assert_eq!(
            set.data_collection,
            BTreeSet::from(["locationInfo".to_string()])
        );
    }

    #[test]
    fn test_is_covered_by_uses_subsumption() {
        let granted = PermissionSet::from_parts(["tabs"], ["*://*.example.com/*"], []);
        assert!(PermissionSet::from_parts([], ["https://a.example.com/*"], []).is_covered_by(&granted));
        assert!(!PermissionSet::from_parts(["storage"], [], []).is_covered_by(&granted));
        assert!(!PermissionSet::from_parts([], ["https://example.org/*"], []).is_covered_by(&granted));
    }

    #[test]
    fn test_compare_permissions() {
        let old = PermissionSet::from_parts(["tabs"], ["*://*.example.com/*"], ["none"]);
        let new = PermissionSet::from_parts(
            ["tabs", "storage"],
            ["http://example.com/*", "https://example.org/*"],
            ["locationInfo"],
        );
        let added = compare_permissions(&old, &new);
        assert_eq!(added.permissions, BTreeSet::from(["storage".to_string()]));
        assert_eq!(
            added.origins,
            BTreeSet::from(["https://example.org/*".to_string()])
        );
        assert_eq!(
            added.data_collection,
            BTreeSet::from(["locationInfo".to_string()])
        );
    }
}
