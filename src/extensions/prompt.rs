//! Strings for permission prompts.
//!
//! [`format_permission_strings`] turns a permission request into the text a
//! prompt shows. It has no side effects and needs no running extension, so
//! UI code can call it before anything is installed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;

use super::manifest::DATA_COLLECTION_NONE;
use super::match_pattern::ALL_URLS;
use super::permissions::PermissionSet;

/// Domains listed individually before the rest are summarised.
const MAX_LISTED_HOSTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Install,
    Update,
    Optional,
    /// Installed by another program and awaiting the user's approval.
    Sideload,
}

/// What the prompt is asking for.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub kind: PromptKind,
    pub addon_name: String,
    pub app_name: String,
    pub permissions: PermissionSet,
}

/// Localized templates looked up by key. `{0}`, `{1}` ... are replaced with
/// arguments.
pub trait StringBundle {
    fn template(&self, key: &str) -> Option<&str>;
}

/// Built-in English strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnglishStrings;

static ENGLISH: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("webextPerms.header", "Add {0}?"),
        ("webextPerms.updateText", "{0} has been updated. You must approve new permissions before the updated version will install."),
        ("webextPerms.updateHeader", "{0} requires new permissions"),
        ("webextPerms.optionalPermsHeader", "{0} requests additional permissions."),
        ("webextPerms.sideloadHeader", "{0} added"),
        ("webextPerms.sideloadText", "Another program on your computer installed an add-on that may affect {1}. Please review the permission requests of {0} and choose Enable or Cancel."),
        ("webextPerms.listIntro", "It requires your permission to:"),
        ("webextPerms.add.label", "Add"),
        ("webextPerms.cancel.label", "Cancel"),
        ("webextPerms.updateAccept.label", "Update"),
        ("webextPerms.optionalPermsAllow.label", "Allow"),
        ("webextPerms.optionalPermsDeny.label", "Deny"),
        ("webextPerms.sideloadEnable.label", "Enable"),
        ("webextPerms.hostDescription.allUrls", "Access your data for all websites"),
        ("webextPerms.hostDescription.wildcard", "Access your data for sites in the {0} domain"),
        ("webextPerms.hostDescription.tooManyWildcards", "Access your data in {0} other domains"),
        ("webextPerms.hostDescription.oneSite", "Access your data for {0}"),
        ("webextPerms.hostDescription.tooManySites", "Access your data on {0} other sites"),
        ("webextPerms.description.bookmarks", "Read and modify bookmarks"),
        ("webextPerms.description.browserSettings", "Read and modify browser settings"),
        ("webextPerms.description.browsingData", "Clear recent browsing history, cookies, and related data"),
        ("webextPerms.description.clipboardRead", "Get data from the clipboard"),
        ("webextPerms.description.clipboardWrite", "Input data to the clipboard"),
        ("webextPerms.description.declarativeNetRequest", "Block content on any page"),
        ("webextPerms.description.declarativeNetRequestFeedback", "Read your browsing history"),
        ("webextPerms.description.devtools", "Extend developer tools to access your data in open tabs"),
        ("webextPerms.description.downloads", "Download files and read and modify the browser's download history"),
        ("webextPerms.description.downloads.open", "Open files downloaded to your computer"),
        ("webextPerms.description.find", "Read the text of all open tabs"),
        ("webextPerms.description.geolocation", "Access your location"),
        ("webextPerms.description.history", "Access browsing history"),
        ("webextPerms.description.management", "Monitor extension usage and manage themes"),
        ("webextPerms.description.nativeMessaging", "Exchange messages with programs other than the browser"),
        ("webextPerms.description.notifications", "Display notifications to you"),
        ("webextPerms.description.pkcs11", "Provide cryptographic authentication services"),
        ("webextPerms.description.privacy", "Read and modify privacy settings"),
        ("webextPerms.description.proxy", "Control browser proxy settings"),
        ("webextPerms.description.sessions", "Access recently closed tabs"),
        ("webextPerms.description.tabs", "Access browser tabs"),
        ("webextPerms.description.tabHide", "Hide and show browser tabs"),
        ("webextPerms.description.topSites", "Access browsing history"),
        ("webextPerms.description.userScripts", "Allow unverified third-party scripts to access your data"),
        ("webextPerms.description.webNavigation", "Access browser activity during navigation"),
        ("webextPerms.dataCollection.required", "The developer says this extension requires collecting: {0}"),
        ("webextPerms.dataCollection.optional", "The developer would like this extension to collect: {0}"),
        ("webextPerms.dataCollection.none", "The developer says this extension doesn't require data collection."),
        ("webextPerms.dataCollection.authenticationInfo", "authentication information"),
        ("webextPerms.dataCollection.bookmarksInfo", "bookmarks"),
        ("webextPerms.dataCollection.browsingActivity", "browsing activity"),
        ("webextPerms.dataCollection.financialAndPaymentInfo", "financial and payment information"),
        ("webextPerms.dataCollection.healthInfo", "health information"),
        ("webextPerms.dataCollection.locationInfo", "location"),
        ("webextPerms.dataCollection.personalCommunications", "personal communications"),
        ("webextPerms.dataCollection.personallyIdentifyingInfo", "personally identifying information"),
        ("webextPerms.dataCollection.searchTerms", "search terms"),
        ("webextPerms.dataCollection.technicalAndInteraction", "technical and interaction data"),
        ("webextPerms.dataCollection.websiteActivity", "website activity"),
        ("webextPerms.dataCollection.websiteContent", "website content"),
    ])
});

impl StringBundle for EnglishStrings {
    fn template(&self, key: &str) -> Option<&str> {
        ENGLISH.get(key).copied()
    }
}

/// Everything a permission prompt displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionStrings {
    pub header: String,
    pub text: Option<String>,
    pub list_intro: Option<String>,
    pub accept_label: String,
    pub cancel_label: String,
    /// Host access lines, in display order.
    pub origins: Vec<String>,
    /// Permission name to description. Permissions without a description
    /// are not shown.
    pub permissions: BTreeMap<String, String>,
    pub data_collection: Vec<String>,
}

impl PermissionStrings {
    pub fn has_details(&self) -> bool {
        !self.origins.is_empty() || !self.permissions.is_empty()
    }
}

fn render(bundle: &dyn StringBundle, key: &str, args: &[&str]) -> Option<String> {
    let mut text = bundle.template(key)?.to_string();
    for (i, arg) in args.iter().enumerate() {
        text = text.replace(&format!("{{{}}}", i), arg);
    }
    Some(text)
}

fn format_or_key(bundle: &dyn StringBundle, key: &str, args: &[&str]) -> String {
    render(bundle, key, args).unwrap_or_else(|| key.to_string())
}

/// Hosts an origin grants access to, grouped for display.
#[derive(Debug, Default)]
struct HostGroups {
    all_urls: bool,
    wildcards: BTreeSet<String>,
    sites: BTreeSet<String>,
}

fn classify_origins(origins: &BTreeSet<String>) -> HostGroups {
    let mut groups = HostGroups::default();
    for origin in origins {
        if origin == ALL_URLS {
            groups.all_urls = true;
            continue;
        }
        let Some((scheme, rest)) = origin.split_once("://") else {
            continue;
        };
        if !matches!(scheme, "*" | "http" | "https" | "ws" | "wss" | "file") {
            continue;
        }
        let host = rest.split('/').next().unwrap_or_default();
        match host {
            "" if scheme == "file" => groups.all_urls = true,
            "" => {}
            "*" => groups.all_urls = true,
            _ => match host.strip_prefix("*.") {
                Some(domain) => {
                    groups.wildcards.insert(domain.to_string());
                }
                None => {
                    groups.sites.insert(host.to_string());
                }
            },
        }
    }
    groups
}

fn host_lines(
    bundle: &dyn StringBundle,
    hosts: &BTreeSet<String>,
    one_key: &str,
    many_key: &str,
) -> Vec<String> {
    let mut lines = Vec::new();
    let listed = if hosts.len() > MAX_LISTED_HOSTS {
        MAX_LISTED_HOSTS - 1
    } else {
        hosts.len()
    };
    for host in hosts.iter().take(listed) {
        lines.push(format_or_key(bundle, one_key, &[host.as_str()]));
    }
    let rest = hosts.len() - listed;
    if rest > 0 {
        lines.push(format_or_key(bundle, many_key, &[rest.to_string().as_str()]));
    }
    lines
}

fn origin_lines(bundle: &dyn StringBundle, origins: &BTreeSet<String>) -> Vec<String> {
    let groups = classify_origins(origins);
    if groups.all_urls {
        return vec![format_or_key(bundle, "webextPerms.hostDescription.allUrls", &[])];
    }
    let mut lines = host_lines(
        bundle,
        &groups.wildcards,
        "webextPerms.hostDescription.wildcard",
        "webextPerms.hostDescription.tooManyWildcards",
    );
    // A site inside a listed wildcard domain adds nothing.
    let sites: BTreeSet<String> = groups
        .sites
        .into_iter()
        .filter(|site| {
            !groups
                .wildcards
                .iter()
                .any(|domain| site == domain || site.ends_with(&format!(".{}", domain)))
        })
        .collect();
    lines.extend(host_lines(
        bundle,
        &sites,
        "webextPerms.hostDescription.oneSite",
        "webextPerms.hostDescription.tooManySites",
    ));
    lines
}

fn data_collection_lines(
    bundle: &dyn StringBundle,
    kind: PromptKind,
    categories: &BTreeSet<String>,
) -> Vec<String> {
    if categories.contains(DATA_COLLECTION_NONE) {
        return if kind == PromptKind::Optional {
            Vec::new()
        } else {
            vec![format_or_key(bundle, "webextPerms.dataCollection.none", &[])]
        };
    }
    if categories.is_empty() {
        return Vec::new();
    }
    let labels: Vec<String> = categories
        .iter()
        .map(|c| render(bundle, &format!("webextPerms.dataCollection.{}", c), &[]).unwrap_or_else(|| c.clone()))
        .collect();
    let key = if kind == PromptKind::Optional {
        "webextPerms.dataCollection.optional"
    } else {
        "webextPerms.dataCollection.required"
    };
    vec![format_or_key(bundle, key, &[labels.join(", ").as_str()])]
}

/// Build the strings for one prompt.
pub fn format_permission_strings(
    request: &PermissionRequest,
    bundle: &dyn StringBundle,
) -> PermissionStrings {
    let name = request.addon_name.as_str();
    let set = &request.permissions;

    let permissions: BTreeMap<String, String> = set
        .permissions
        .iter()
        .filter_map(|p| {
            let text = render(bundle, &format!("webextPerms.description.{}", p), &[])?;
            Some((p.clone(), text))
        })
        .collect();

    let mut strings = PermissionStrings {
        origins: origin_lines(bundle, &set.origins),
        permissions,
        data_collection: data_collection_lines(bundle, request.kind, &set.data_collection),
        ..Default::default()
    };
    let details = strings.has_details();

    let (header, text, accept, cancel) = match request.kind {
        PromptKind::Install => (
            format_or_key(bundle, "webextPerms.header", &[name]),
            None,
            "webextPerms.add.label",
            "webextPerms.cancel.label",
        ),
        PromptKind::Update => (
            format_or_key(bundle, "webextPerms.updateHeader", &[name]),
            render(bundle, "webextPerms.updateText", &[name]),
            "webextPerms.updateAccept.label",
            "webextPerms.cancel.label",
        ),
        PromptKind::Optional => (
            format_or_key(bundle, "webextPerms.optionalPermsHeader", &[name]),
            None,
            "webextPerms.optionalPermsAllow.label",
            "webextPerms.optionalPermsDeny.label",
        ),
        PromptKind::Sideload => (
            format_or_key(bundle, "webextPerms.sideloadHeader", &[name]),
            render(bundle, "webextPerms.sideloadText", &[name, request.app_name.as_str()]),
            "webextPerms.sideloadEnable.label",
            "webextPerms.cancel.label",
        ),
    };

    strings.header = header;
    strings.text = text;
    strings.accept_label = format_or_key(bundle, accept, &[]);
    strings.cancel_label = format_or_key(bundle, cancel, &[]);
    if details && request.kind != PromptKind::Optional {
        strings.list_intro = render(bundle, "webextPerms.listIntro", &[]);
    }
    strings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: PromptKind, permissions: PermissionSet) -> PermissionRequest {
        PermissionRequest {
            kind,
            addon_name: "Tabby".to_string(),
            app_name: "Firefox".to_string(),
            permissions,
        }
    }

    #[test]
    fn test_install_prompt() {
        let set = PermissionSet::from_parts(
            ["tabs", "storage"],
            ["https://example.com/*", "*://*.mozilla.org/*"],
            [],
        );
        let strings = format_permission_strings(&request(PromptKind::Install, set), &EnglishStrings);
        assert_eq!(strings.header, "Add Tabby?");
        assert_eq!(strings.accept_label, "Add");
        assert_eq!(strings.permissions.len(), 1);
        assert_eq!(strings.permissions["tabs"], "Access browser tabs");
        assert_eq!(
            strings.origins,
            vec![
                "Access your data for sites in the mozilla.org domain",
                "Access your data for example.com",
            ]
        );
        assert!(strings.list_intro.is_some());
    }

    #[test]
    fn test_all_urls_hides_other_hosts() {
        let set = PermissionSet::from_parts([], ["<all_urls>", "https://example.com/*"], []);
        let strings = format_permission_strings(&request(PromptKind::Install, set), &EnglishStrings);
        assert_eq!(strings.origins, vec!["Access your data for all websites"]);

        let set = PermissionSet::from_parts([], ["*://*/*"], []);
        let strings = format_permission_strings(&request(PromptKind::Update, set), &EnglishStrings);
        assert_eq!(strings.origins, vec!["Access your data for all websites"]);
        assert!(strings.text.unwrap().contains("Tabby has been updated"));
    }

    #[test]
    fn test_collapses_many_sites() {
        let origins: Vec<String> = (1..=6).map(|i| format!("https://site{}.example/*", i)).collect();
        let set = PermissionSet::from_parts([], origins.iter().map(String::as_str), []);
        let strings = format_permission_strings(&request(PromptKind::Install, set), &EnglishStrings);
        assert_eq!(strings.origins.len(), MAX_LISTED_HOSTS);
        assert_eq!(strings.origins[3], "Access your data on 3 other sites");
    }

    #[test]
    fn test_site_within_wildcard_not_repeated() {
        let set = PermissionSet::from_parts([], ["*://*.example.com/*", "https://www.example.com/*"], []);
        let strings = format_permission_strings(&request(PromptKind::Install, set), &EnglishStrings);
        assert_eq!(strings.origins.len(), 1);
    }

    #[test]
    fn test_optional_prompt_and_data_collection() {
        let set = PermissionSet::from_parts(["bookmarks"], [], ["locationInfo", "searchTerms"]);
        let strings = format_permission_strings(&request(PromptKind::Optional, set), &EnglishStrings);
        assert_eq!(strings.header, "Tabby requests additional permissions.");
        assert_eq!((strings.accept_label.as_str(), strings.cancel_label.as_str()), ("Allow", "Deny"));
        assert_eq!(
            strings.data_collection,
            vec!["The developer would like this extension to collect: location, search terms"]
        );
        assert!(strings.list_intro.is_none());

        let none = PermissionSet::from_parts([], [], ["none"]);
        let strings = format_permission_strings(&request(PromptKind::Install, none), &EnglishStrings);
        assert_eq!(
            strings.data_collection,
            vec!["The developer says this extension doesn't require data collection."]
        );
        assert!(!strings.has_details());
    }

    #[test]
    fn test_sideload_and_missing_strings() {
        struct Empty;
        impl StringBundle for Empty {
            fn template(&self, _key: &str) -> Option<&str> {
                None
            }
        }
        let strings = format_permission_strings(
            &request(PromptKind::Sideload, PermissionSet::from_parts(["tabs"], [], [])),
            &Empty,
        );
        assert_eq!(strings.header, "webextPerms.sideloadHeader");
        assert!(strings.permissions.is_empty());

        let strings = format_permission_strings(
            &request(PromptKind::Sideload, PermissionSet::default()),
            &EnglishStrings,
        );
        assert_eq!(strings.accept_label, "Enable");
        assert!(strings.text.unwrap().contains("affect Firefox"));
    }
}
