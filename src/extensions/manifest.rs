//! Extension manifest parsing and normalisation.
//!
//! Each extension ships a `manifest.json` that defines:
//! - Metadata (id, name, version, default locale)
//! - Requested permissions, host permissions, and data collection
//! - Entry points (content scripts, background, action, options page)
//! - Kind-specific keys (theme, dictionaries, langpack)
//!
//! [`normalize`] validates the untrusted document against the rules for its
//! manifest version and produces an immutable [`NormalizedManifest`]. Fatal
//! problems come back as [`ValidationError`]s; everything recoverable is
//! recorded as a warning on the manifest and the extension continues.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::FeatureFlags;

use super::error::{ExtensionError, ExtensionResult};
use super::json_comments::strip_comments;
use super::locale::Localizer;
use super::match_pattern::MatchPattern;

/// Maximum name length; longer names are truncated with a warning.
pub const MAX_NAME_LENGTH: usize = 75;

pub const DEFAULT_CSP_V2: &str = "script-src 'self' 'wasm-unsafe-eval'; object-src 'self';";
pub const DEFAULT_CSP_V3: &str = "script-src 'self' 'wasm-unsafe-eval'; upgrade-insecure-requests;";

/// Manifest keys whose objects carry a `browser_style` flag.
const BROWSER_STYLE_KEYS: &[&str] = &["action", "browser_action", "page_action", "sidebar_action"];

const KNOWN_KEYS: &[&str] = &[
    "action",
    "applications",
    "author",
    "background",
    "browser_action",
    "browser_specific_settings",
    "chrome_settings_overrides",
    "chrome_url_overrides",
    "commands",
    "content_scripts",
    "content_security_policy",
    "declarative_net_request",
    "default_locale",
    "description",
    "developer",
    "devtools_page",
    "dictionaries",
    "experiment_apis",
    "homepage_url",
    "host_permissions",
    "icons",
    "incognito",
    "l10n_resources",
    "langpack_id",
    "languages",
    "manifest_version",
    "name",
    "omnibox",
    "optional_host_permissions",
    "optional_permissions",
    "options_page",
    "options_ui",
    "page_action",
    "permissions",
    "protocol_handlers",
    "short_name",
    "sidebar_action",
    "sources",
    "storage",
    "theme",
    "theme_experiment",
    "user_scripts",
    "version",
    "version_name",
    "web_accessible_resources",
];

/// Data collection categories an extension may declare.
pub const DATA_COLLECTION_CATEGORIES: &[&str] = &[
    "none",
    "authenticationInfo",
    "bookmarksInfo",
    "browsingActivity",
    "financialAndPaymentInfo",
    "healthInfo",
    "locationInfo",
    "personalCommunications",
    "personallyIdentifyingInfo",
    "searchTerms",
    "technicalAndInteraction",
    "websiteActivity",
    "websiteContent",
];

/// Sentinel data collection value meaning "collects nothing".
pub const DATA_COLLECTION_NONE: &str = "none";

static EMAIL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9\-._]*@[a-zA-Z0-9\-._]+$").expect("static regex"));
static GUID_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\}$")
        .expect("static regex")
});
static VERSION_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0|[1-9][0-9]{0,8})(\.(0|[1-9][0-9]{0,8})){0,3}$").expect("static regex")
});

/// Kind of add-on described by a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonType {
    Extension,
    Theme,
    Locale,
    Dictionary,
}

/// Facts about the install that influence validation.
#[derive(Debug, Clone, Default)]
pub struct ManifestContext {
    /// Id the host add-on manager knows this add-on by.
    pub id: Option<String>,
    pub temporarily_installed: bool,
    pub is_privileged: bool,
    pub flags: FeatureFlags,
}

/// A fatal manifest problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A toolbar/page/sidebar action entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionManifest {
    pub default_title: Option<String>,
    pub default_popup: Option<String>,
    pub browser_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsUi {
    pub page: String,
    pub open_in_tab: bool,
    pub browser_style: bool,
}

/// A content script declaration with validated match patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentScript {
    pub matches: Vec<String>,
    #[serde(default)]
    pub exclude_matches: Vec<String>,
    #[serde(default)]
    pub js: Vec<String>,
    #[serde(default)]
    pub css: Vec<String>,
    #[serde(default = "default_run_at")]
    pub run_at: String,
    #[serde(default)]
    pub all_frames: bool,
    #[serde(default)]
    pub match_about_blank: bool,
}

fn default_run_at() -> String {
    "document_idle".to_string()
}

/// Web accessible resources, normalised to the MV3 object shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAccessibleResource {
    pub resources: Vec<String>,
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub extension_ids: Vec<String>,
}

/// Declared data collection categories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCollectionDeclaration {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

/// Langpack-specific manifest keys.
#[derive(Debug, Clone, PartialEq)]
pub struct LangpackManifest {
    pub langpack_id: String,
    pub languages: BTreeMap<String, Value>,
    pub l10n_resources: Vec<String>,
    pub sources: Value,
}

/// A validated manifest. Never mutated; upgrades replace it wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedManifest {
    pub manifest_version: u8,
    pub addon_type: AddonType,
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub homepage_url: Option<String>,
    pub default_locale: Option<String>,
    pub permissions: Vec<String>,
    pub host_permissions: Vec<String>,
    pub optional_permissions: Vec<String>,
    pub optional_host_permissions: Vec<String>,
    pub data_collection: DataCollectionDeclaration,
    pub content_scripts: Vec<ContentScript>,
    pub web_accessible_resources: Vec<WebAccessibleResource>,
    pub content_security_policy: String,
    pub actions: BTreeMap<String, ActionManifest>,
    pub options_ui: Option<OptionsUi>,
    pub devtools_page: Option<String>,
    pub background: Option<Value>,
    pub experiment_apis: BTreeMap<String, Value>,
    pub dictionaries: BTreeMap<String, String>,
    pub langpack: Option<LangpackManifest>,
    pub warnings: Vec<String>,
    pub raw: Value,
}

impl NormalizedManifest {
    /// Manifest keys present in the raw document.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.raw
            .as_object()
            .into_iter()
            .flat_map(|m| m.keys().map(String::as_str))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.raw.get(key).is_some()
    }

    /// Return a localized copy. `__MSG_key__` references in user-visible
    /// strings are substituted; the original is left untouched.
    pub fn localize(&self, localizer: &Localizer) -> Self {
        let mut localized = self.clone();
        let name = localizer.localize(&self.name);
        localized.name = truncate_name(name, &mut localized.warnings);
        localized.description = self.description.as_deref().map(|d| localizer.localize(d));
        for action in localized.actions.values_mut() {
            if let Some(title) = action.default_title.as_mut() {
                *title = localizer.localize(title);
            }
        }
        localized
    }
}

/// Strip comments, parse JSON, and normalise.
///
/// JSON syntax problems are packaging errors; validation failures come
/// back as [`ExtensionError::ManifestInvalid`].
pub fn parse_manifest_text(
    text: &str,
    location: &str,
    ctx: &ManifestContext,
) -> ExtensionResult<NormalizedManifest> {
    let stripped = strip_comments(text).map_err(|e| ExtensionError::Packaging {
        location: location.to_string(),
        message: e.to_string(),
    })?;

    let raw: Value = serde_json::from_str(&stripped).map_err(|e| ExtensionError::Packaging {
        location: location.to_string(),
        message: format!("manifest is not valid JSON: {}", e),
    })?;

    normalize(raw, ctx).map_err(|errors| ExtensionError::ManifestInvalid {
        id: ctx.id.clone().unwrap_or_else(|| location.to_string()),
        errors: errors.into_iter().map(|e| e.message).collect(),
    })
}

/// Validate a raw manifest document.
pub fn normalize(
    raw: Value,
    ctx: &ManifestContext,
) -> Result<NormalizedManifest, Vec<ValidationError>> {
    let Some(obj) = raw.as_object() else {
        return Err(vec![ValidationError::new("manifest must be a JSON object")]);
    };

    let mut v = Validator {
        ctx,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let manifest_version = match obj.get("manifest_version").and_then(Value::as_u64) {
        Some(2) => 2,
        Some(3) => 3,
        Some(other) => {
            return Err(vec![ValidationError::new(format!(
                "unsupported manifest_version {}",
                other
            ))])
        }
        None => {
            return Err(vec![ValidationError::new(
                "manifest_version is required and must be an integer",
            )])
        }
    };

    for key in obj.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) && !key.starts_with('_') && key != "$schema" {
            v.warn(format!("unexpected property '{}'", key));
        }
    }

    let addon_type = if obj.contains_key("theme") {
        AddonType::Theme
    } else if obj.contains_key("dictionaries") {
        AddonType::Dictionary
    } else if obj.contains_key("langpack_id") {
        AddonType::Locale
    } else {
        AddonType::Extension
    };

    let id = v.id(obj, manifest_version);
    let name = match obj.get("name").and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => truncate_name(name.to_string(), &mut v.warnings),
        _ => {
            v.error("name is required and must be a non-empty string");
            String::new()
        }
    };
    let version = match obj.get("version").and_then(Value::as_str) {
        Some(version) if !version.is_empty() => {
            if !VERSION_FORMAT.is_match(version) {
                v.warn(format!(
                    "version '{}' should be up to four dot-separated integers",
                    version
                ));
            }
            version.to_string()
        }
        _ => {
            v.error("version is required and must be a string");
            String::new()
        }
    };

    let permissions = v.string_array(obj, "permissions");
    let optional_permissions = v.string_array(obj, "optional_permissions");
    let (host_permissions, optional_host_permissions) = if manifest_version >= 3 {
        (
            v.string_array(obj, "host_permissions"),
            v.string_array(obj, "optional_host_permissions"),
        )
    } else {
        for key in ["host_permissions", "optional_host_permissions"] {
            if obj.contains_key(key) {
                v.warn(format!("'{}' is not supported in manifest version 2", key));
            }
        }
        (Vec::new(), Vec::new())
    };

    let actions = v.actions(obj, manifest_version);
    let options_ui = v.options_ui(obj, manifest_version);
    let content_security_policy = v.csp(obj, manifest_version);
    let web_accessible_resources = v.web_accessible_resources(obj, manifest_version);
    let content_scripts = v.content_scripts(obj);
    let data_collection = v.data_collection(obj);
    let experiment_apis = v.experiment_apis(obj, addon_type);
    let dictionaries = v.dictionaries(obj);
    let langpack = v.langpack(obj);

    let default_locale = obj
        .get("default_locale")
        .and_then(Value::as_str)
        .map(str::to_string);
    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);
    let homepage_url = obj
        .get("homepage_url")
        .and_then(Value::as_str)
        .map(str::to_string);
    let devtools_page = obj
        .get("devtools_page")
        .and_then(Value::as_str)
        .map(str::to_string);
    let background = obj.get("background").cloned();

    if !v.errors.is_empty() {
        return Err(v.errors);
    }

    for warning in &v.warnings {
        tracing::warn!(extension_id = %id, "manifest warning: {}", warning);
    }

    Ok(NormalizedManifest {
        manifest_version,
        addon_type,
        id,
        name,
        description,
        version,
        homepage_url,
        default_locale,
        permissions,
        host_permissions,
        optional_permissions,
        optional_host_permissions,
        data_collection,
        content_scripts,
        web_accessible_resources,
        content_security_policy,
        actions,
        options_ui,
        devtools_page,
        background,
        experiment_apis,
        dictionaries,
        langpack,
        warnings: v.warnings,
        raw,
    })
}

fn truncate_name(name: String, warnings: &mut Vec<String>) -> String {
    if name.chars().count() <= MAX_NAME_LENGTH {
        return name;
    }
    warnings.push(format!(
        "name is longer than {} characters and was truncated",
        MAX_NAME_LENGTH
    ));
    name.chars().take(MAX_NAME_LENGTH).collect()
}

pub fn is_valid_addon_id(id: &str) -> bool {
    EMAIL_ID.is_match(id) || GUID_ID.is_match(id)
}

/// Whether a privileged-only manifest feature may be used, and what to do
/// when it may not.
enum PrivilegeDecision {
    Allowed,
    Warn,
    Reject,
}

struct Validator<'a> {
    ctx: &'a ManifestContext,
    errors: Vec<ValidationError>,
    warnings: Vec<String>,
}

impl Validator<'_> {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(ValidationError::new(message));
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn id(&mut self, obj: &Map<String, Value>, manifest_version: u8) -> String {
        let gecko_id = |key: &str| {
            obj.get(key)
                .and_then(|v| v.get("gecko"))
                .and_then(|g| g.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let declared = match gecko_id("browser_specific_settings") {
            Some(id) => Some(id),
            None => {
                let legacy = gecko_id("applications");
                if legacy.is_some() && manifest_version >= 3 {
                    self.warn("'applications' is deprecated, use 'browser_specific_settings'");
                }
                legacy
            }
        };

        let id = match (declared, self.ctx.id.clone()) {
            (Some(declared), Some(host)) if declared != host => {
                self.error(format!(
                    "manifest id '{}' does not match installed id '{}'",
                    declared, host
                ));
                return host;
            }
            (Some(declared), _) => declared,
            (None, Some(host)) => host,
            (None, None) if self.ctx.temporarily_installed => {
                format!("{}@temporary-addon", uuid::Uuid::new_v4())
            }
            (None, None) => {
                self.error("an add-on id is required");
                return String::new();
            }
        };

        if !is_valid_addon_id(&id) {
            self.error(format!("invalid add-on id '{}'", id));
        }
        id
    }

    fn string_array(&mut self, obj: &Map<String, Value>, key: &str) -> Vec<String> {
        match obj.get(key) {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item.as_str() {
                    Some(s) => Some(s.to_string()),
                    None => {
                        self.warn(format!("ignoring non-string entry in '{}'", key));
                        None
                    }
                })
                .collect(),
            Some(_) => {
                self.error(format!("'{}' must be an array of strings", key));
                Vec::new()
            }
        }
    }

    fn browser_style(&mut self, key: &str, value: &Value, manifest_version: u8) -> bool {
        match (value.get("browser_style").and_then(Value::as_bool), manifest_version) {
            (Some(true), 3) => {
                self.warn(format!(
                    "'{}.browser_style: true' is not supported in manifest version 3, using false",
                    key
                ));
                false
            }
            (Some(explicit), _) => explicit,
            (None, 2) => true,
            (None, _) => false,
        }
    }

    fn actions(
        &mut self,
        obj: &Map<String, Value>,
        manifest_version: u8,
    ) -> BTreeMap<String, ActionManifest> {
        let mut actions = BTreeMap::new();
        for &key in BROWSER_STYLE_KEYS {
            let Some(value) = obj.get(key) else {
                continue;
            };
            if (key == "browser_action" && manifest_version >= 3)
                || (key == "action" && manifest_version < 3)
            {
                self.warn(format!(
                    "'{}' is not supported in manifest version {}",
                    key, manifest_version
                ));
                continue;
            }
            if !value.is_object() {
                self.error(format!("'{}' must be an object", key));
                continue;
            }
            let browser_style = self.browser_style(key, value, manifest_version);
            actions.insert(
                key.to_string(),
                ActionManifest {
                    default_title: value
                        .get("default_title")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    default_popup: value
                        .get("default_popup")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    browser_style,
                },
            );
        }
        actions
    }

    fn options_ui(&mut self, obj: &Map<String, Value>, manifest_version: u8) -> Option<OptionsUi> {
        if let Some(value) = obj.get("options_ui") {
            let Some(page) = value.get("page").and_then(Value::as_str) else {
                self.error("'options_ui.page' is required");
                return None;
            };
            let browser_style = self.browser_style("options_ui", value, manifest_version);
            return Some(OptionsUi {
                page: page.to_string(),
                open_in_tab: value
                    .get("open_in_tab")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                browser_style,
            });
        }

        // options_page is the legacy spelling of an options tab.
        obj.get("options_page")
            .and_then(Value::as_str)
            .map(|page| OptionsUi {
                page: page.to_string(),
                open_in_tab: true,
                browser_style: false,
            })
    }

    fn csp(&mut self, obj: &Map<String, Value>, manifest_version: u8) -> String {
        let default = if manifest_version >= 3 {
            DEFAULT_CSP_V3
        } else {
            DEFAULT_CSP_V2
        };
        match (obj.get("content_security_policy"), manifest_version) {
            (None, _) => default.to_string(),
            (Some(Value::String(csp)), 2) => csp.clone(),
            (Some(Value::Object(csp)), 3) => match csp.get("extension_pages") {
                None => default.to_string(),
                Some(Value::String(pages)) => pages.clone(),
                Some(_) => {
                    self.warn("'content_security_policy.extension_pages' must be a string");
                    default.to_string()
                }
            },
            (Some(_), _) => {
                self.warn(format!(
                    "'content_security_policy' has the wrong shape for manifest version {}",
                    manifest_version
                ));
                default.to_string()
            }
        }
    }

    fn web_accessible_resources(
        &mut self,
        obj: &Map<String, Value>,
        manifest_version: u8,
    ) -> Vec<WebAccessibleResource> {
        let Some(value) = obj.get("web_accessible_resources") else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            self.warn("'web_accessible_resources' must be an array");
            return Vec::new();
        };

        if manifest_version < 3 {
            let resources: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    let s = item.as_str().map(str::to_string);
                    if s.is_none() {
                        self.warn("ignoring non-string web_accessible_resources entry");
                    }
                    s
                })
                .collect();
            if resources.is_empty() {
                return Vec::new();
            }
            return vec![WebAccessibleResource {
                resources,
                matches: vec![super::match_pattern::ALL_URLS.to_string()],
                extension_ids: Vec::new(),
            }];
        }

        items
            .iter()
            .filter_map(|item| {
                match serde_json::from_value::<WebAccessibleResource>(item.clone()) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        self.warn(format!("ignoring web_accessible_resources entry: {}", e));
                        None
                    }
                }
            })
            .collect()
    }

    fn content_scripts(&mut self, obj: &Map<String, Value>) -> Vec<ContentScript> {
        let Some(value) = obj.get("content_scripts") else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            self.error("'content_scripts' must be an array");
            return Vec::new();
        };
        let restrict_schemes = !self.ctx.is_privileged;

        let mut scripts = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            let script = match serde_json::from_value::<ContentScript>(item.clone()) {
                Ok(script) => script,
                Err(e) => {
                    self.error(format!("content_scripts[{}]: {}", idx, e));
                    continue;
                }
            };
            if !matches!(
                script.run_at.as_str(),
                "document_start" | "document_end" | "document_idle"
            ) {
                self.error(format!(
                    "content_scripts[{}]: invalid run_at '{}'",
                    idx, script.run_at
                ));
                continue;
            }
            let mut valid = true;
            for pattern in script.matches.iter().chain(&script.exclude_matches) {
                if let Err(e) = MatchPattern::parse(pattern, restrict_schemes, false) {
                    self.error(format!("content_scripts[{}]: {}", idx, e));
                    valid = false;
                }
            }
            if valid {
                scripts.push(script);
            }
        }
        scripts
    }

    fn data_collection(&mut self, obj: &Map<String, Value>) -> DataCollectionDeclaration {
        let Some(value) = obj
            .get("browser_specific_settings")
            .and_then(|b| b.get("gecko"))
            .and_then(|g| g.get("data_collection_permissions"))
        else {
            return DataCollectionDeclaration::default();
        };

        let mut read = |key: &str| -> Vec<String> {
            let Some(items) = value.get(key).and_then(Value::as_array) else {
                return Vec::new();
            };
            let mut out: Vec<String> = Vec::new();
            for item in items {
                match item.as_str() {
                    Some(c) if DATA_COLLECTION_CATEGORIES.contains(&c) => {
                        if !out.iter().any(|o| o == c) {
                            out.push(c.to_string());
                        }
                    }
                    other => self.warn(format!(
                        "ignoring unknown data collection category {:?}",
                        other.unwrap_or_default()
                    )),
                }
            }
            out
        };

        let mut required = read("required");
        let mut optional = read("optional");

        if required.iter().any(|c| c == DATA_COLLECTION_NONE) && required.len() > 1 {
            self.warn("'none' cannot be combined with other data collection categories");
            required.retain(|c| c != DATA_COLLECTION_NONE);
        }
        if optional.iter().any(|c| c == DATA_COLLECTION_NONE) {
            self.warn("'none' is not a valid optional data collection category");
            optional.retain(|c| c != DATA_COLLECTION_NONE);
        }

        DataCollectionDeclaration { required, optional }
    }

    /// Per-check policy for privileged-only manifest features.
    fn privileged_feature(&self, experiments: bool) -> PrivilegeDecision {
        if self.ctx.is_privileged {
            PrivilegeDecision::Allowed
        } else if !self.ctx.temporarily_installed {
            PrivilegeDecision::Reject
        } else if experiments && self.ctx.flags.experiments_enabled {
            PrivilegeDecision::Allowed
        } else {
            PrivilegeDecision::Warn
        }
    }

    fn experiment_apis(
        &mut self,
        obj: &Map<String, Value>,
        addon_type: AddonType,
    ) -> BTreeMap<String, Value> {
        let Some(value) = obj.get("experiment_apis") else {
            return BTreeMap::new();
        };
        if addon_type != AddonType::Extension {
            self.warn("'experiment_apis' is only supported for extensions");
            return BTreeMap::new();
        }
        match self.privileged_feature(true) {
            PrivilegeDecision::Allowed => {}
            PrivilegeDecision::Warn => {
                self.warn("'experiment_apis' requires a privileged add-on and was ignored");
                return BTreeMap::new();
            }
            PrivilegeDecision::Reject => {
                self.error("using 'experiment_apis' requires a privileged add-on");
                return BTreeMap::new();
            }
        }
        match value.as_object() {
            Some(apis) => apis.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => {
                self.error("'experiment_apis' must be an object");
                BTreeMap::new()
            }
        }
    }

    fn dictionaries(&mut self, obj: &Map<String, Value>) -> BTreeMap<String, String> {
        let Some(value) = obj.get("dictionaries") else {
            return BTreeMap::new();
        };
        let Some(map) = value.as_object() else {
            self.error("'dictionaries' must be an object");
            return BTreeMap::new();
        };
        let mut dictionaries = BTreeMap::new();
        for (lang, path) in map {
            match path.as_str() {
                Some(path) if path.ends_with(".dic") => {
                    dictionaries.insert(lang.clone(), path.to_string());
                }
                _ => self.error(format!(
                    "dictionary '{}' must point to a .dic file",
                    lang
                )),
            }
        }
        dictionaries
    }

    fn langpack(&mut self, obj: &Map<String, Value>) -> Option<LangpackManifest> {
        let mut l10n_resources = self.string_array(obj, "l10n_resources");
        if !l10n_resources.is_empty() {
            match self.privileged_feature(false) {
                PrivilegeDecision::Allowed => {}
                PrivilegeDecision::Warn => {
                    self.warn("'l10n_resources' requires a privileged add-on and was ignored");
                    l10n_resources.clear();
                }
                PrivilegeDecision::Reject => {
                    self.error("using 'l10n_resources' requires a privileged add-on");
                    l10n_resources.clear();
                }
            }
        }

        let langpack_id = obj.get("langpack_id")?;
        let Some(langpack_id) = langpack_id.as_str() else {
            self.error("'langpack_id' must be a string");
            return None;
        };
        let languages = match obj.get("languages") {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(_) => {
                self.error("'languages' must be an object");
                BTreeMap::new()
            }
            None => {
                self.error("a langpack must declare 'languages'");
                BTreeMap::new()
            }
        };

        Some(LangpackManifest {
            langpack_id: langpack_id.to_string(),
            languages,
            l10n_resources,
            sources: obj.get("sources").cloned().unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ManifestContext {
        ManifestContext {
            id: Some("test@example.com".to_string()),
            ..Default::default()
        }
    }

    fn minimal(version: u8) -> Value {
        json!({ "manifest_version": version, "name": "T", "version": "1.0" })
    }

    #[test]
    fn test_parse_minimal_manifest() {
        let m = normalize(minimal(3), &ctx()).unwrap();
        assert_eq!(m.id, "test@example.com");
        assert_eq!(m.name, "T");
        assert_eq!(m.addon_type, AddonType::Extension);
        assert_eq!(m.content_security_policy, DEFAULT_CSP_V3);
        assert!(m.warnings.is_empty());
    }

    #[test]
    fn test_parse_text_with_comments() {
        let text = r#"{
            // Comment before the version
            "manifest_version": 2,
            "name": "Commented",
            "version": "2.0",
            "homepage_url": "https://example.com/home" // trailing
        }"#;
        let m = parse_manifest_text(text, "memory", &ctx()).unwrap();
        assert_eq!(m.homepage_url.as_deref(), Some("https://example.com/home"));
    }

    #[test]
    fn test_unterminated_string_is_packaging_error() {
        let err = parse_manifest_text(r#"{"name": "T}"#, "memory", &ctx()).unwrap_err();
        assert!(matches!(err, ExtensionError::Packaging { .. }));
    }

    #[test]
    fn test_missing_name_is_error() {
        let errors = normalize(json!({"manifest_version": 2, "version": "1"}), &ctx()).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("name")));
    }

    #[test]
    fn test_long_name_truncated_with_warning() {
        let mut raw = minimal(3);
        raw["name"] = json!("x".repeat(80));
        let m = normalize(raw, &ctx()).unwrap();
        assert_eq!(m.name.chars().count(), MAX_NAME_LENGTH);
        assert!(m.warnings.iter().any(|w| w.contains("truncated")));
    }

    #[test]
    fn test_browser_style_defaults() {
        let mut v2 = minimal(2);
        v2["browser_action"] = json!({"default_title": "B"});
        v2["page_action"] = json!({"browser_style": false});
        let m = normalize(v2, &ctx()).unwrap();
        assert!(m.actions["browser_action"].browser_style);
        assert!(!m.actions["page_action"].browser_style);

        let mut v3 = minimal(3);
        v3["action"] = json!({});
        v3["sidebar_action"] = json!({"browser_style": true});
        let m = normalize(v3, &ctx()).unwrap();
        assert!(!m.actions["action"].browser_style);
        assert!(!m.actions["sidebar_action"].browser_style);
        assert!(m.warnings.iter().any(|w| w.contains("sidebar_action.browser_style")));
    }

    #[test]
    fn test_version_gated_keys() {
        let mut v3 = minimal(3);
        v3["browser_action"] = json!({});
        let m = normalize(v3, &ctx()).unwrap();
        assert!(m.actions.is_empty());
        assert_eq!(m.warnings.len(), 1);

        let mut v2 = minimal(2);
        v2["host_permissions"] = json!(["https://example.com/*"]);
        let m = normalize(v2, &ctx()).unwrap();
        assert!(m.host_permissions.is_empty());
        assert_eq!(m.warnings.len(), 1);
    }

    #[test]
    fn test_csp_shapes() {
        let mut v2 = minimal(2);
        v2["content_security_policy"] = json!("script-src 'self'");
        assert_eq!(normalize(v2, &ctx()).unwrap().content_security_policy, "script-src 'self'");

        let mut v3 = minimal(3);
        v3["content_security_policy"] = json!({"extension_pages": "script-src 'self'"});
        assert_eq!(normalize(v3, &ctx()).unwrap().content_security_policy, "script-src 'self'");

        let mut wrong = minimal(3);
        wrong["content_security_policy"] = json!("script-src 'self'");
        let m = normalize(wrong, &ctx()).unwrap();
        assert_eq!(m.content_security_policy, DEFAULT_CSP_V3);
        assert_eq!(m.warnings.len(), 1);
    }

    #[test]
    fn test_default_csp_allows_wasm() {
        assert_eq!(
            normalize(minimal(2), &ctx()).unwrap().content_security_policy,
            "script-src 'self' 'wasm-unsafe-eval'; object-src 'self';"
        );
        assert_eq!(
            normalize(minimal(3), &ctx()).unwrap().content_security_policy,
            "script-src 'self' 'wasm-unsafe-eval'; upgrade-insecure-requests;"
        );
    }

    #[test]
    fn test_web_accessible_resources_shapes() {
        let mut v2 = minimal(2);
        v2["web_accessible_resources"] = json!(["img/*.png", 4]);
        let m = normalize(v2, &ctx()).unwrap();
        assert_eq!(m.web_accessible_resources[0].resources, vec!["img/*.png"]);
        assert_eq!(m.warnings.len(), 1);

        let mut v3 = minimal(3);
        v3["web_accessible_resources"] =
            json!([{"resources": ["a.js"], "matches": ["https://example.com/*"]}, "b.js"]);
        let m = normalize(v3, &ctx()).unwrap();
        assert_eq!(m.web_accessible_resources.len(), 1);
        assert_eq!(m.web_accessible_resources[0].matches, vec!["https://example.com/*"]);
    }

    #[test]
    fn test_content_script_validation() {
        let mut raw = minimal(2);
        raw["content_scripts"] = json!([{"matches": ["https://example.com/*"], "js": ["a.js"]}]);
        let m = normalize(raw, &ctx()).unwrap();
        assert_eq!(m.content_scripts[0].run_at, "document_idle");

        let mut bad = minimal(2);
        bad["content_scripts"] = json!([{"matches": ["not-a-pattern"]}]);
        assert!(normalize(bad, &ctx()).is_err());
    }

    #[test]
    fn test_id_sources() {
        let mut raw = minimal(3);
        raw["browser_specific_settings"] = json!({"gecko": {"id": "other@example.com"}});
        assert!(normalize(raw, &ctx()).is_err());

        let mut legacy = minimal(2);
        legacy["applications"] = json!({"gecko": {"id": "{12345678-1234-1234-1234-123456789abc}"}});
        let m = normalize(legacy, &ManifestContext::default()).unwrap();
        assert_eq!(m.id, "{12345678-1234-1234-1234-123456789abc}");

        assert!(normalize(minimal(2), &ManifestContext::default()).is_err());

        let temporary = ManifestContext {
            temporarily_installed: true,
            ..Default::default()
        };
        let m = normalize(minimal(2), &temporary).unwrap();
        assert!(m.id.ends_with("@temporary-addon"));
    }

    #[test]
    fn test_experiment_apis_policy() {
        let mut raw = minimal(2);
        raw["experiment_apis"] = json!({"sync": {"schema": "schema.json"}});

        assert!(normalize(raw.clone(), &ctx()).is_err());

        let temporary = ManifestContext {
            temporarily_installed: true,
            ..ctx()
        };
        let m = normalize(raw.clone(), &temporary).unwrap();
        assert!(m.experiment_apis.is_empty());
        assert_eq!(m.warnings.len(), 1);

        let enabled = ManifestContext {
            temporarily_installed: true,
            flags: FeatureFlags {
                experiments_enabled: true,
                ..FeatureFlags::default()
            },
            ..ctx()
        };
        assert!(normalize(raw.clone(), &enabled).unwrap().experiment_apis.contains_key("sync"));

        let privileged = ManifestContext {
            is_privileged: true,
            ..ctx()
        };
        assert!(normalize(raw, &privileged).unwrap().experiment_apis.contains_key("sync"));
    }

    #[test]
    fn test_data_collection_none_sentinel() {
        let mut raw = minimal(3);
        raw["browser_specific_settings"] = json!({"gecko": {
            "id": "test@example.com",
            "data_collection_permissions": {
                "required": ["none", "locationInfo"],
                "optional": ["none", "healthInfo", "bogus"]
            }
        }});
        let m = normalize(raw, &ctx()).unwrap();
        assert_eq!(m.data_collection.required, vec!["locationInfo"]);
        assert_eq!(m.data_collection.optional, vec!["healthInfo"]);
        assert_eq!(m.warnings.len(), 3);
    }

    #[test]
    fn test_addon_types() {
        let mut theme = minimal(2);
        theme["theme"] = json!({"colors": {}});
        assert_eq!(normalize(theme, &ctx()).unwrap().addon_type, AddonType::Theme);

        let mut dict = minimal(2);
        dict["dictionaries"] = json!({"en-US": "en-US.dic"});
        let m = normalize(dict, &ctx()).unwrap();
        assert_eq!(m.addon_type, AddonType::Dictionary);
        assert_eq!(m.dictionaries["en-US"], "en-US.dic");
    }

    #[test]
    fn test_unknown_key_warns() {
        let mut raw = minimal(2);
        raw["frobnicate"] = json!(true);
        raw["_comment"] = json!("ignored");
        let m = normalize(raw, &ctx()).unwrap();
        assert_eq!(m.warnings.len(), 1);
        assert!(m.warnings[0].contains("frobnicate"));
    }
}
