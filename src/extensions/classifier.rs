//! Classification of requested permission tokens.
//!
//! Every string in `permissions`, `host_permissions` or
//! `optional_permissions` is exactly one of: a host origin, an experiment
//! API, an ordinary named permission, or invalid.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::FeatureFlags;

use super::match_pattern::MatchPattern;

/// Permissions only privileged extensions may request.
pub const PRIVILEGED_PERMISSIONS: &[&str] = &[
    "activityLog",
    "mozillaAddons",
    "networkStatus",
    "normandyAddonStudy",
    "telemetry",
];

static PERMISSION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)(?:\.(\w+)(?:\.\w+)*)?$").expect("static regex"));

/// Result of classifying one permission token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A host match pattern, normalised with the path ignored.
    Origin(String),
    /// An `experiments.<name>` API permission.
    Api(String),
    /// An ordinary named permission.
    Permission(String),
    /// Not usable. `privileged` is set when the token is a privileged-only
    /// permission requested by an unprivileged extension.
    Invalid { token: String, privileged: bool },
}

impl Classification {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Classification::Invalid { .. })
    }
}

/// Stateless classifier, parameterised by runtime feature flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionClassifier {
    flags: FeatureFlags,
}

impl PermissionClassifier {
    pub fn new(flags: FeatureFlags) -> Self {
        Self { flags }
    }

    pub fn flags(&self) -> FeatureFlags {
        self.flags
    }

    /// Classify one token.
    ///
    /// `manifest_version` gates permissions whose availability depends on
    /// it (currently `userScripts` under MV3).
    pub fn classify(
        &self,
        token: &str,
        restrict_schemes: bool,
        is_privileged: bool,
        manifest_version: u8,
    ) -> Classification {
        let Some(caps) = PERMISSION_NAME.captures(token) else {
            return match MatchPattern::parse(token, restrict_schemes, true) {
                Ok(pattern) => Classification::Origin(pattern.as_str().to_string()),
                Err(_) => Classification::Invalid {
                    token: token.to_string(),
                    privileged: false,
                },
            };
        };

        let head = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let api = caps.get(2).map(|m| m.as_str());

        if head == "experiments" {
            if let Some(name) = api {
                return Classification::Api(name.to_string());
            }
        }

        if !is_privileged && PRIVILEGED_PERMISSIONS.contains(&head) {
            return Classification::Invalid {
                token: token.to_string(),
                privileged: true,
            };
        }

        if token.starts_with("declarativeNetRequest") && !self.flags.dnr_enabled {
            return Classification::Invalid {
                token: token.to_string(),
                privileged: false,
            };
        }

        if token == "userScripts" && manifest_version >= 3 && !self.flags.user_scripts_mv3_enabled {
            return Classification::Invalid {
                token: token.to_string(),
                privileged: false,
            };
        }

        Classification::Permission(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> PermissionClassifier {
        PermissionClassifier::new(FeatureFlags::default())
    }

    #[test]
    fn test_ordinary_permissions() {
        let c = classifier();
        assert_eq!(
            c.classify("storage", true, false, 3),
            Classification::Permission("storage".into())
        );
        assert_eq!(
            c.classify("devtools.panels", true, false, 2),
            Classification::Permission("devtools.panels".into())
        );
    }

    #[test]
    fn test_origin_normalised() {
        assert_eq!(
            classifier().classify("https://example.com/path/*", true, false, 3),
            Classification::Origin("https://example.com/*".into())
        );
        assert_eq!(
            classifier().classify("<all_urls>", true, false, 2),
            Classification::Origin("<all_urls>".into())
        );
    }

    #[test]
    fn test_experiment_api() {
        assert_eq!(
            classifier().classify("experiments.sync", true, false, 2),
            Classification::Api("sync".into())
        );
        // A bare "experiments" is just a name.
        assert_eq!(
            classifier().classify("experiments", true, false, 2),
            Classification::Permission("experiments".into())
        );
    }

    #[test]
    fn test_privileged_gate() {
        let c = classifier();
        assert_eq!(
            c.classify("telemetry", true, false, 2),
            Classification::Invalid {
                token: "telemetry".into(),
                privileged: true
            }
        );
        assert_eq!(
            c.classify("telemetry", true, true, 2),
            Classification::Permission("telemetry".into())
        );
    }

    #[test]
    fn test_feature_flag_gates_ignore_privilege() {
        let c = PermissionClassifier::new(FeatureFlags {
            dnr_enabled: false,
            ..FeatureFlags::default()
        });
        assert!(c.classify("declarativeNetRequestWithHostAccess", true, true, 3).is_invalid());
        assert!(c.classify("userScripts", true, true, 3).is_invalid());
        assert!(!c.classify("userScripts", true, true, 2).is_invalid());
    }

    #[test]
    fn test_invalid_token() {
        assert_eq!(
            classifier().classify("not a perm", true, false, 2),
            Classification::Invalid {
                token: "not a perm".into(),
                privileged: false
            }
        );
    }

    #[test]
    fn test_each_token_lands_in_one_class() {
        let c = classifier();
        let cases = [
            ("tabs", "permission"),
            ("experiments.x", "api"),
            ("telemetry", "invalid"),
            ("*://*/*", "origin"),
            ("https://", "invalid"),
            ("", "invalid"),
            ("a.b.c", "permission"),
            ("ftp://host/", "origin"),
        ];
        for (token, expected) in cases {
            let kind = match c.classify(token, true, false, 3) {
                Classification::Origin(_) => "origin",
                Classification::Api(_) => "api",
                Classification::Permission(_) => "permission",
                Classification::Invalid { .. } => "invalid",
            };
            assert_eq!(kind, expected, "token {token:?}");
        }
    }
}
