//! Exclusion rules: decide whether a captured exchange is reported at all.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How an exclusion rule matches a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum ExclusionMatcher {
    /// Substring match on the URL host.
    Domain(String),
    /// Substring match on the full URL.
    Url(String),
    /// Regex over the full URL.
    Regex(String),
}

/// Immutable once inserted; removed by rule identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionRule {
    pub id: String,
    #[serde(flatten)]
    pub matcher: ExclusionMatcher,
}

impl ExclusionRule {
    pub fn new(matcher: ExclusionMatcher) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            matcher,
        }
    }

    /// Whether this rule matches `url`. Malformed URLs or patterns make the
    /// rule non-matching, never matching.
    pub fn matches(&self, url: &str) -> bool {
        match &self.matcher {
            ExclusionMatcher::Domain(pattern) => match url::Url::parse(url) {
                Ok(parsed) => parsed
                    .host_str()
                    .map(|h| h.contains(pattern.as_str()))
                    .unwrap_or(false),
                Err(_) => false,
            },
            ExclusionMatcher::Url(pattern) => url.contains(pattern.as_str()),
            ExclusionMatcher::Regex(pattern) => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(url),
                Err(e) => {
                    warn!("Invalid exclusion regex '{}': {}", pattern, e);
                    false
                }
            },
        }
    }
}

/// First match wins.
pub fn is_excluded(url: &str, rules: &[ExclusionRule]) -> bool {
    rules.iter().any(|r| r.matches(url))
}

/// Regex patterns in `rules` that fail to compile, for the installation
/// ack. Such rules simply never match at filter time.
pub fn invalid_patterns(rules: &[ExclusionRule]) -> Vec<String> {
    rules
        .iter()
        .filter_map(|r| match &r.matcher {
            ExclusionMatcher::Regex(pattern) => regex::Regex::new(pattern)
                .err()
                .map(|e| format!("'{}': {}", pattern, e)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(pattern: &str) -> ExclusionRule {
        ExclusionRule::new(ExclusionMatcher::Domain(pattern.to_string()))
    }

    #[test]
    fn empty_rules_exclude_nothing() {
        assert!(!is_excluded("https://example.com/x", &[]));
    }

    #[test]
    fn domain_matches_host_substring_only() {
        let rules = vec![domain("google")];
        assert!(is_excluded("https://fonts.google.com/css", &rules));
        // Substring in the path is not a host match.
        assert!(!is_excluded("https://example.com/google", &rules));
    }

    #[test]
    fn url_matches_full_url_substring() {
        let rules = vec![ExclusionRule::new(ExclusionMatcher::Url("/track".into()))];
        assert!(is_excluded("https://a.test/track?id=1", &rules));
        assert!(!is_excluded("https://a.test/page", &rules));
    }

    #[test]
    fn regex_matches_full_url() {
        let rules = vec![ExclusionRule::new(ExclusionMatcher::Regex(
            r"\.(png|woff2?)$".into(),
        ))];
        assert!(is_excluded("https://a.test/logo.png", &rules));
        assert!(!is_excluded("https://a.test/app.js", &rules));
    }

    #[test]
    fn malformed_input_never_matches() {
        let rules = vec![
            domain("a.test"),
            ExclusionRule::new(ExclusionMatcher::Regex("(unclosed".into())),
        ];
        assert!(!is_excluded("not a url", &rules));
        assert!(!is_excluded("https://example.com/", &rules));
    }
}
