//! Host match patterns (`scheme://host/path`).
//!
//! Domain subsumption follows the host browser's rules exactly: a wildcard
//! pattern `*.example.com` covers `example.com` and every subdomain, while an
//! exact `example.com` never covers `*.example.com`. Scheme is ignored for
//! domain comparison.

use thiserror::Error;

/// Schemes matched by a `*` scheme wildcard.
pub const WEB_SCHEMES: &[&str] = &["http", "https", "ws", "wss"];

/// Schemes any extension may use.
const PERMITTED_SCHEMES: &[&str] = &["http", "https", "ws", "wss", "file", "ftp", "data"];

/// Extra schemes accepted when scheme restriction is off.
const PRIVILEGED_SCHEMES: &[&str] = &["about", "chrome", "moz-extension", "resource"];

pub const ALL_URLS: &str = "<all_urls>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("Match pattern '{0}' has no scheme separator")]
    MissingScheme(String),

    #[error("Match pattern '{pattern}' uses unsupported scheme '{scheme}'")]
    UnsupportedScheme { pattern: String, scheme: String },

    #[error("Match pattern '{0}' is missing a host")]
    MissingHost(String),

    #[error("Match pattern '{0}' has an invalid host")]
    InvalidHost(String),

    #[error("Match pattern '{0}' is missing a path")]
    MissingPath(String),
}

/// A parsed match pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPattern {
    pattern: String,
    schemes: Vec<String>,
    /// Domain without any `*.` prefix. Empty for `*` and `<all_urls>`.
    domain: String,
    match_subdomain: bool,
    path: String,
}

impl MatchPattern {
    /// Parse a match pattern.
    ///
    /// With `ignore_path` the path component is replaced with `/*`, which is
    /// how host permissions are normalised.
    pub fn parse(text: &str, restrict_schemes: bool, ignore_path: bool) -> Result<Self, PatternError> {
        let allowed_scheme = |scheme: &str| {
            PERMITTED_SCHEMES.contains(&scheme)
                || (!restrict_schemes && PRIVILEGED_SCHEMES.contains(&scheme))
        };

        if text == ALL_URLS {
            let schemes = PERMITTED_SCHEMES
                .iter()
                .chain(PRIVILEGED_SCHEMES.iter())
                .filter(|s| allowed_scheme(s))
                .map(|s| s.to_string())
                .collect();
            return Ok(Self {
                pattern: ALL_URLS.to_string(),
                schemes,
                domain: String::new(),
                match_subdomain: true,
                path: "/*".to_string(),
            });
        }

        let (scheme, rest) = text
            .split_once("://")
            .ok_or_else(|| PatternError::MissingScheme(text.to_string()))?;
        let scheme = scheme.to_ascii_lowercase();

        let schemes: Vec<String> = if scheme == "*" {
            WEB_SCHEMES.iter().map(|s| s.to_string()).collect()
        } else if allowed_scheme(&scheme) {
            vec![scheme.clone()]
        } else {
            return Err(PatternError::UnsupportedScheme {
                pattern: text.to_string(),
                scheme,
            });
        };

        let slash = rest
            .find('/')
            .ok_or_else(|| PatternError::MissingPath(text.to_string()))?;
        let host = rest[..slash].to_ascii_lowercase();
        let path = if ignore_path {
            "/*".to_string()
        } else {
            rest[slash..].to_string()
        };

        let (domain, match_subdomain) = if host == "*" {
            (String::new(), true)
        } else if let Some(suffix) = host.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err(PatternError::InvalidHost(text.to_string()));
            }
            (suffix.to_string(), true)
        } else {
            (host.clone(), false)
        };

        if domain.contains('*') {
            return Err(PatternError::InvalidHost(text.to_string()));
        }
        if host.is_empty() && scheme != "file" {
            return Err(PatternError::MissingHost(text.to_string()));
        }

        Ok(Self {
            pattern: format!("{}://{}{}", scheme, host, path),
            schemes,
            domain,
            match_subdomain,
            path,
        })
    }

    /// The normalised pattern text.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn schemes(&self) -> &[String] {
        &self.schemes
    }

    /// Whether the domain part is a full wildcard (`*` or `<all_urls>`).
    pub fn domain_is_wildcard(&self) -> bool {
        self.match_subdomain && self.domain.is_empty()
    }

    /// Check a bare domain against this pattern's host part.
    pub fn matches_domain(&self, domain: &str) -> bool {
        if self.domain_is_wildcard() || self.domain == domain {
            return true;
        }
        if self.match_subdomain && domain.len() > self.domain.len() {
            let offset = domain.len() - self.domain.len();
            return domain.as_bytes()[offset - 1] == b'.' && domain[offset..] == self.domain;
        }
        false
    }

    /// Scheme-insensitive domain subsumption.
    pub fn subsumes_domain(&self, other: &MatchPattern) -> bool {
        if !self.match_subdomain && other.match_subdomain && other.domain == self.domain {
            return false;
        }
        self.matches_domain(&other.domain)
    }

    /// Full subsumption: every scheme of `other` is covered and the domain
    /// is subsumed. Paths are not compared.
    pub fn subsumes(&self, other: &MatchPattern) -> bool {
        other.schemes.iter().all(|s| self.schemes.contains(s)) && self.subsumes_domain(other)
    }

    /// Check a concrete URL against the pattern.
    pub fn matches_url(&self, url: &str) -> bool {
        let Some((scheme, rest)) = url.split_once("://") else {
            return false;
        };
        if !self.schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
            return false;
        }
        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let host = host.to_ascii_lowercase();
        self.matches_domain(&host) && glob_match(&self.path, path)
    }
}

impl std::fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// `*`-only glob used for the path component.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    if parts.is_empty() {
        return rest.is_empty();
    }
    for (idx, part) in parts.iter().enumerate() {
        let last = idx == parts.len() - 1;
        if last {
            return rest.ends_with(part);
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

/// A set of match patterns.
#[derive(Debug, Clone, Default)]
pub struct MatchPatternSet {
    patterns: Vec<MatchPattern>,
}

impl MatchPatternSet {
    /// Build a set, skipping entries that fail to parse.
    pub fn from_strings<'a>(
        patterns: impl IntoIterator<Item = &'a String>,
        restrict_schemes: bool,
    ) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .filter_map(|p| MatchPattern::parse(p, restrict_schemes, false).ok())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn subsumes_domain(&self, pattern: &MatchPattern) -> bool {
        self.patterns.iter().any(|p| p.subsumes_domain(pattern))
    }

    pub fn subsumes(&self, pattern: &MatchPattern) -> bool {
        self.patterns.iter().any(|p| p.subsumes(pattern))
    }

    pub fn matches_url(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_url(url))
    }
}
