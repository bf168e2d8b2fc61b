//! Authoritative permission state for one extension instance.
//!
//! The active set is the manifest's required permissions plus whatever
//! optional permissions the user granted. Grants live in a
//! [`PermissionStore`]; every mutation is written there before the
//! in-memory state changes, so the store is the source of truth after a
//! crash.

use std::sync::Arc;

use super::error::{ExtensionError, ExtensionResult};
use super::permission_store::PermissionStore;
use super::permissions::{compare_permissions, covers_origin, ManifestPermissions, PermissionSet};

/// Outcome of reconciling grants against a new manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Previously required, now optional: granted without asking.
    pub promoted: PermissionSet,
    /// No longer declared anywhere: dropped from the grant store.
    pub revoked: PermissionSet,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.revoked.is_empty()
    }
}

pub struct PermissionSetManager {
    extension_id: String,
    declared: ManifestPermissions,
    /// Optional permissions currently granted.
    granted: PermissionSet,
    /// Grants discarded at load because the manifest stopped declaring them.
    dropped: PermissionSet,
    store: Arc<dyn PermissionStore>,
}

impl PermissionSetManager {
    /// Load grants, dropping anything the manifest no longer declares.
    pub async fn load(
        extension_id: &str,
        declared: ManifestPermissions,
        store: Arc<dyn PermissionStore>,
    ) -> ExtensionResult<Self> {
        let stored = store.load(extension_id).await?;
        let mut manager = Self {
            extension_id: extension_id.to_string(),
            declared,
            granted: PermissionSet::default(),
            dropped: PermissionSet::default(),
            store,
        };

        let kept = manager.filter_declared(&stored);
        if kept != stored {
            tracing::debug!(
                extension_id,
                dropped = ?stored.difference(&kept).names(),
                "dropping grants no longer declared"
            );
            manager.store.save(extension_id, &kept).await?;
            manager.dropped = stored.difference(&kept);
        }
        manager.granted = kept;
        Ok(manager)
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn declared(&self) -> &ManifestPermissions {
        &self.declared
    }

    /// Granted optional permissions, as persisted.
    pub fn granted(&self) -> &PermissionSet {
        &self.granted
    }

    /// Take the grants dropped at load, for settings cleanup.
    pub fn take_dropped(&mut self) -> PermissionSet {
        std::mem::take(&mut self.dropped)
    }

    /// Required permissions plus granted optional ones.
    pub fn active(&self) -> PermissionSet {
        self.declared.required_permissions().union(&self.granted)
    }

    /// Keep only the parts of `set` that the manifest still declares.
    fn filter_declared(&self, set: &PermissionSet) -> PermissionSet {
        let allowed = self
            .declared
            .required_permissions()
            .union(&self.declared.optional_permissions());
        let mut kept = PermissionSet {
            permissions: set
                .permissions
                .intersection(&allowed.permissions)
                .cloned()
                .collect(),
            origins: set
                .origins
                .iter()
                .filter(|o| covers_origin(&allowed.origins, o))
                .cloned()
                .collect(),
            data_collection: set
                .data_collection
                .intersection(&allowed.data_collection)
                .cloned()
                .collect(),
        };
        kept.normalize_data_collection();
        kept
    }

    /// Grant optional permissions. Returns what was newly added; granting
    /// an already-granted set is a no-op and does not touch the store.
    pub async fn add(&mut self, request: &PermissionSet) -> ExtensionResult<PermissionSet> {
        let optional = self.declared.optional_permissions();
        if let Some(undeclared) = first_uncovered(request, &optional) {
            return Err(ExtensionError::PermissionNotDeclared {
                extension: self.extension_id.clone(),
                permission: undeclared,
            });
        }

        let added = compare_permissions(&self.active(), request);
        if added.is_empty() {
            return Ok(added);
        }

        let next = self.granted.union(&added);
        self.store.save(&self.extension_id, &next).await?;
        self.granted = next;
        Ok(added)
    }

    /// Revoke optional permissions. Returns what was actually removed.
    pub async fn remove(&mut self, request: &PermissionSet) -> ExtensionResult<PermissionSet> {
        let required = self.declared.required_permissions();
        if let Some(name) = request
            .permissions
            .intersection(&required.permissions)
            .chain(request.origins.intersection(&required.origins))
            .chain(
                request
                    .data_collection
                    .intersection(&required.data_collection),
            )
            .next()
        {
            return Err(ExtensionError::CannotRemoveRequired {
                extension: self.extension_id.clone(),
                permission: name.clone(),
            });
        }

        let removed = request.intersection(&self.granted);
        if removed.is_empty() {
            return Ok(removed);
        }

        let next = self.granted.difference(&removed);
        self.store.save(&self.extension_id, &next).await?;
        self.granted = next;
        Ok(removed)
    }

    /// Move to a new manifest's declaration.
    ///
    /// `old_required` is what the previous version required. Anything it
    /// required that the new version only offers as optional is granted,
    /// since the user consented at install time. Grants the new manifest no
    /// longer declares are revoked.
    pub async fn migrate(
        &mut self,
        declared: ManifestPermissions,
        old_required: &PermissionSet,
    ) -> ExtensionResult<MigrationReport> {
        let previous = std::mem::replace(&mut self.declared, declared);

        let new_required = self.declared.required_permissions();
        let promoted = self
            .filter_optional(old_required)
            .difference(&new_required)
            .difference(&self.granted);

        let kept = self.filter_declared(&self.granted);
        let mut revoked = self.granted.difference(&kept);
        // A formerly required permission that is now gone entirely.
        let gone = old_required.difference(&self.filter_declared(old_required));
        revoked.extend(&gone);

        let next = kept.union(&promoted);
        if next != self.granted {
            if let Err(e) = self.store.save(&self.extension_id, &next).await {
                self.declared = previous;
                return Err(e.into());
            }
        }
        self.granted = next;

        let report = MigrationReport { promoted, revoked };
        if !report.is_empty() {
            tracing::info!(
                extension_id = %self.extension_id,
                promoted = ?report.promoted.names(),
                revoked = ?report.revoked.names(),
                "migrated permissions"
            );
        }
        Ok(report)
    }

    fn filter_optional(&self, set: &PermissionSet) -> PermissionSet {
        let optional = self.declared.optional_permissions();
        PermissionSet {
            permissions: set
                .permissions
                .intersection(&optional.permissions)
                .cloned()
                .collect(),
            origins: set
                .origins
                .iter()
                .filter(|o| covers_origin(&optional.origins, o))
                .cloned()
                .collect(),
            data_collection: set
                .data_collection
                .intersection(&optional.data_collection)
                .cloned()
                .collect(),
        }
    }

    /// Forget every grant for this extension.
    pub async fn clear(&mut self) -> ExtensionResult<()> {
        self.store.remove(&self.extension_id).await?;
        self.granted = PermissionSet::default();
        Ok(())
    }
}

/// First entry of `request` that `allowed` does not cover.
fn first_uncovered(request: &PermissionSet, allowed: &PermissionSet) -> Option<String> {
    request
        .permissions
        .iter()
        .find(|p| !allowed.permissions.contains(*p))
        .or_else(|| {
            request
                .origins
                .iter()
                .find(|o| !covers_origin(&allowed.origins, o))
        })
        .or_else(|| {
            request
                .data_collection
                .iter()
                .find(|d| !allowed.data_collection.contains(*d))
        })
        .cloned()
}
