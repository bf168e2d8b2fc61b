//! Locale negotiation and `_locales/<tag>/messages.json` message lookup.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::error::{ExtensionError, ExtensionResult};
use super::json_comments::strip_comments;
use super::package::ExtensionPackage;

pub const LOCALES_DIR: &str = "_locales";

static MSG_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__MSG_([A-Za-z0-9@_]+?)__").expect("static regex"));
static NAMED_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z0-9@_]+)\$").expect("static regex"));
static POSITIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(?:([1-9][0-9]*)|(\$+))").expect("static regex"));

const RTL_LANGUAGES: &[&str] = &["ar", "ckb", "fa", "he", "ur"];

fn normalize_tag(tag: &str) -> String {
    tag.replace('_', "-").to_ascii_lowercase()
}

/// `en-US-x` -> [`en-us-x`, `en-us`, `en`]
fn fallback_chain(tag: &str) -> Vec<String> {
    let normalized = normalize_tag(tag);
    let parts: Vec<&str> = normalized.split('-').filter(|p| !p.is_empty()).collect();
    (1..=parts.len())
        .rev()
        .map(|n| parts[..n].join("-"))
        .collect()
}

/// Pick the best available locale.
///
/// Each preferred tag is tried through its variant chain before moving on
/// to the next preference. The declared default is the last resort.
/// Returns the tag as spelled in `available`.
pub fn resolve_locale(
    preferred: &[String],
    available: &[String],
    default: Option<&str>,
) -> Option<String> {
    let find = |candidate: &str| {
        available
            .iter()
            .find(|a| normalize_tag(a) == candidate)
            .cloned()
    };

    for tag in preferred {
        for candidate in fallback_chain(tag) {
            if let Some(found) = find(candidate.as_str()) {
                return Some(found);
            }
        }
    }

    default.and_then(|d| find(normalize_tag(d).as_str()))
}

#[derive(Debug, Clone, Deserialize)]
struct RawMessage {
    message: String,
    #[serde(default)]
    placeholders: HashMap<String, RawPlaceholder>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawPlaceholder {
    content: String,
}

/// One message, with lowercased placeholder names.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub message: String,
    pub placeholders: HashMap<String, String>,
}

/// Messages for one locale, keyed by lowercased message name.
pub type MessageMap = HashMap<String, Message>;

/// Parse a `messages.json` document.
pub fn parse_messages(text: &str, location: &str) -> ExtensionResult<MessageMap> {
    let packaging = |message: String| ExtensionError::Packaging {
        location: location.to_string(),
        message,
    };

    let stripped = strip_comments(text).map_err(|e| packaging(e.to_string()))?;
    let raw: HashMap<String, RawMessage> =
        serde_json::from_str(&stripped).map_err(|e| packaging(e.to_string()))?;

    Ok(raw
        .into_iter()
        .map(|(key, raw)| {
            let placeholders = raw
                .placeholders
                .into_iter()
                .map(|(name, p)| (name.to_lowercase(), p.content))
                .collect();
            (
                key.to_lowercase(),
                Message {
                    message: raw.message,
                    placeholders,
                },
            )
        })
        .collect())
}

/// Loads and caches message maps from an extension package.
pub struct LocaleResolver {
    package: Arc<dyn ExtensionPackage>,
    cache: Mutex<HashMap<String, Arc<MessageMap>>>,
}

impl LocaleResolver {
    pub fn new(package: Arc<dyn ExtensionPackage>) -> Self {
        Self {
            package,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Locale directories shipped in the package.
    pub async fn available_locales(&self) -> ExtensionResult<Vec<String>> {
        if !self.package.exists(LOCALES_DIR).await {
            return Ok(Vec::new());
        }
        self.package.list_dir(LOCALES_DIR).await
    }

    pub async fn load_messages(&self, tag: &str) -> ExtensionResult<Arc<MessageMap>> {
        let mut cache = self.cache.lock().await;
        if let Some(messages) = cache.get(tag) {
            return Ok(messages.clone());
        }

        let path = format!("{}/{}/messages.json", LOCALES_DIR, tag);
        let text = self.package.read_text(&path).await?;
        let messages = Arc::new(parse_messages(&text, &path)?);
        cache.insert(tag.to_string(), messages.clone());
        Ok(messages)
    }

    /// Negotiate a locale and load it together with the default locale.
    pub async fn initialize(
        &self,
        extension_id: &str,
        preferred: &[String],
        default_locale: Option<&str>,
    ) -> ExtensionResult<Localizer> {
        let ui_locale = preferred
            .first()
            .cloned()
            .unwrap_or_else(|| "en-US".to_string());

        let Some(default_locale) = default_locale else {
            return Ok(Localizer::empty(extension_id, &ui_locale));
        };

        let available = self.available_locales().await?;
        let default_tag = resolve_locale(&[default_locale.to_string()], &available, None);
        let selected = resolve_locale(preferred, &available, Some(default_locale));

        let default_messages = match &default_tag {
            Some(tag) => self.load_messages(tag).await?,
            None => {
                tracing::warn!(
                    extension_id,
                    default_locale,
                    "default locale is not shipped in the package"
                );
                Arc::new(MessageMap::new())
            }
        };
        let messages = match &selected {
            Some(tag) if Some(tag) != default_tag.as_ref() => self.load_messages(tag).await?,
            _ => default_messages.clone(),
        };

        tracing::debug!(extension_id, selected = ?selected, "resolved locale");
        Ok(Localizer {
            extension_id: extension_id.to_string(),
            ui_locale,
            selected,
            messages,
            default_messages,
        })
    }
}

/// Message lookup for one extension in its negotiated locale.
#[derive(Debug, Clone)]
pub struct Localizer {
    extension_id: String,
    ui_locale: String,
    selected: Option<String>,
    messages: Arc<MessageMap>,
    default_messages: Arc<MessageMap>,
}

impl Localizer {
    /// A localizer with no messages. Only predefined messages resolve.
    pub fn empty(extension_id: &str, ui_locale: &str) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            ui_locale: ui_locale.to_string(),
            selected: None,
            messages: Arc::new(MessageMap::new()),
            default_messages: Arc::new(MessageMap::new()),
        }
    }

    pub fn selected_locale(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    fn is_rtl(&self) -> bool {
        let lang = normalize_tag(&self.ui_locale);
        let lang = lang.split('-').next().unwrap_or_default();
        RTL_LANGUAGES.contains(&lang)
    }

    fn predefined(&self, key: &str) -> Option<String> {
        let (dir, reversed, start, end) = if self.is_rtl() {
            ("rtl", "ltr", "right", "left")
        } else {
            ("ltr", "rtl", "left", "right")
        };
        let value = match key {
            "@@ui_locale" => self.ui_locale.replace('-', "_"),
            "@@extension_id" => self.extension_id.clone(),
            "@@bidi_dir" => dir.to_string(),
            "@@bidi_reversed_dir" => reversed.to_string(),
            "@@bidi_start_edge" => start.to_string(),
            "@@bidi_end_edge" => end.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Look up a message, falling back to the default locale.
    ///
    /// Named `$placeholder$`s expand to their content; a name with no
    /// definition stays verbatim. `$1`..`$9` take positional substitutions
    /// (missing ones become empty) and `$$` is a literal `$`.
    pub fn get_message(&self, key: &str, substitutions: &[&str]) -> Option<String> {
        let key = key.to_lowercase();
        if let Some(value) = self.predefined(&key) {
            return Some(value);
        }

        let entry = self
            .messages
            .get(&key)
            .or_else(|| self.default_messages.get(&key))?;

        let named = NAMED_PLACEHOLDER.replace_all(&entry.message, |caps: &Captures| {
            let name = caps[1].to_lowercase();
            entry
                .placeholders
                .get(&name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        });

        let expanded = POSITIONAL.replace_all(&named, |caps: &Captures| {
            if let Some(index) = caps.get(1) {
                let idx = index.as_str().parse::<usize>().unwrap_or(0);
                return substitutions
                    .get(idx.wrapping_sub(1))
                    .map(|s| s.to_string())
                    .unwrap_or_default();
            }
            // `$$$` -> `$$`: one dollar sign is consumed as the escape.
            caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default()
        });

        Some(expanded.into_owned())
    }

    /// Replace `__MSG_key__` references. Unknown keys become empty.
    pub fn localize(&self, text: &str) -> String {
        if !text.contains("__MSG_") {
            return text.to_string();
        }
        MSG_REFERENCE
            .replace_all(text, |caps: &Captures| {
                self.get_message(&caps[1], &[]).unwrap_or_else(|| {
                    tracing::warn!(
                        extension_id = %self.extension_id,
                        key = &caps[1],
                        "unknown localization message"
                    );
                    String::new()
                })
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::package::MemoryPackage;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_variant_chain() {
        let available = tags(&["de", "en", "fr_CA"]);
        assert_eq!(
            resolve_locale(&tags(&["en-US"]), &available, Some("de")),
            Some("en".to_string())
        );
        assert_eq!(
            resolve_locale(&tags(&["fr-CA"]), &available, Some("de")),
            Some("fr_CA".to_string())
        );
        assert_eq!(
            resolve_locale(&tags(&["ja", "de-AT"]), &available, Some("en")),
            Some("de".to_string())
        );
        assert_eq!(
            resolve_locale(&tags(&["ja"]), &available, Some("en")),
            Some("en".to_string())
        );
        assert_eq!(resolve_locale(&tags(&["ja"]), &[], Some("en")), None);
    }

    fn localizer() -> Localizer {
        let messages = parse_messages(
            r#"{
                "greeting": {
                    "message": "Hello $USER$, you have $COUNT$ items and $unknown$",
                    "placeholders": {
                        "user": {"content": "$1"},
                        "count": {"content": "$2"}
                    }
                },
                "price": {"message": "Costs $$5"},
                "onlyHere": {"message": "selected"}
            }"#,
            "messages.json",
        )
        .unwrap();
        let defaults = parse_messages(
            r#"{"fallback": {"message": "from default"}, "onlyhere": {"message": "default"}}"#,
            "messages.json",
        )
        .unwrap();
        Localizer {
            extension_id: "loc@example.com".to_string(),
            ui_locale: "en-US".to_string(),
            selected: Some("en".to_string()),
            messages: Arc::new(messages),
            default_messages: Arc::new(defaults),
        }
    }

    #[test]
    fn test_placeholders() {
        let l = localizer();
        assert_eq!(
            l.get_message("greeting", &["Ann", "3"]).unwrap(),
            "Hello Ann, you have 3 items and $unknown$"
        );
        assert_eq!(
            l.get_message("GREETING", &["Ann"]).unwrap(),
            "Hello Ann, you have  items and $unknown$"
        );
        assert_eq!(l.get_message("price", &[]).unwrap(), "Costs $5");
    }

    #[test]
    fn test_default_locale_fallback() {
        let l = localizer();
        assert_eq!(l.get_message("fallback", &[]).unwrap(), "from default");
        assert_eq!(l.get_message("onlyHere", &[]).unwrap(), "selected");
        assert_eq!(l.get_message("missing", &[]), None);
    }

    #[test]
    fn test_predefined_messages() {
        let l = localizer();
        assert_eq!(l.get_message("@@ui_locale", &[]).unwrap(), "en_US");
        assert_eq!(l.get_message("@@extension_id", &[]).unwrap(), "loc@example.com");
        assert_eq!(l.get_message("@@bidi_dir", &[]).unwrap(), "ltr");
        assert_eq!(
            Localizer::empty("x", "he").get_message("@@bidi_dir", &[]).unwrap(),
            "rtl"
        );
    }

    #[test]
    fn test_localize_text() {
        let l = localizer();
        assert_eq!(l.localize("__MSG_fallback__!"), "from default!");
        assert_eq!(l.localize("[__MSG_nope__]"), "[]");
        assert_eq!(l.localize("plain"), "plain");
    }

    #[tokio::test]
    async fn test_initialize_loads_selected_and_default() {
        let package = MemoryPackage::new()
            .with_file("_locales/en/messages.json", r#"{"name": {"message": "English"}, "only_en": {"message": "en"}}"#)
            .with_file("_locales/fr/messages.json", r#"{"name": {"message": "Français"}}"#);
        let resolver = LocaleResolver::new(Arc::new(package));

        let l = resolver
            .initialize("loc@example.com", &tags(&["fr-FR"]), Some("en"))
            .await
            .unwrap();
        assert_eq!(l.selected_locale(), Some("fr"));
        assert_eq!(l.get_message("name", &[]).unwrap(), "Français");
        assert_eq!(l.get_message("only_en", &[]).unwrap(), "en");
    }
}
