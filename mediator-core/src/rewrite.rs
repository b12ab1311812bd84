//! Match-and-replace rule engine.
//!
//! Rules apply at six hook points (request/response first line, headers,
//! body) in insertion order: the output of rule *i* is the input of rule
//! *i+1*. Literal rules replace every occurrence; regex rules replace
//! globally and support the regex crate's `$1` capture syntax in the
//! replacement, uniformly across all scopes. An invalid regex disables the
//! rule with a warning; it never fails traffic.

use crate::exchange::{Header, HeaderList};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

/// The six hook points a rule can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteScope {
    RequestHeader,
    ResponseHeader,
    RequestBody,
    ResponseBody,
    RequestFirstLine,
    ResponseFirstLine,
}

/// One ordered match-and-replace rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReplaceRule {
    pub id: String,
    pub enabled: bool,
    pub scope: RewriteScope,
    pub match_pattern: String,
    pub replacement: String,
    pub is_regex: bool,
    #[serde(default)]
    pub comment: String,
}

/// Applies rule lists to traffic payloads. Pure besides the compiled-regex
/// caches, which are keyed by pattern identity; a pattern that fails to
/// compile is cached as disabled so the warning fires once.
#[derive(Debug, Default)]
pub struct RewriteEngine {
    text_cache: RwLock<HashMap<String, Option<Regex>>>,
    byte_cache: RwLock<HashMap<String, Option<BytesRegex>>>,
}

impl RewriteEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn text_regex(&self, pattern: &str) -> Option<Regex> {
        {
            let cache = self.text_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(pattern) {
                return cached.clone();
            }
        }
        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Invalid rewrite pattern '{}', rule disabled: {}", pattern, e);
                None
            }
        };
        self.text_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), compiled.clone());
        compiled
    }

    fn byte_regex(&self, pattern: &str) -> Option<BytesRegex> {
        {
            let cache = self.byte_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(pattern) {
                return cached.clone();
            }
        }
        let compiled = match BytesRegex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Invalid rewrite pattern '{}', rule disabled: {}", pattern, e);
                None
            }
        };
        self.byte_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), compiled.clone());
        compiled
    }

    fn rules_for<'a>(
        rules: &'a [MatchReplaceRule],
        scope: RewriteScope,
    ) -> impl Iterator<Item = &'a MatchReplaceRule> {
        rules.iter().filter(move |r| r.enabled && r.scope == scope)
    }

    fn apply_text(&self, rule: &MatchReplaceRule, input: &str) -> String {
        if rule.is_regex {
            match self.text_regex(&rule.match_pattern) {
                Some(re) => re.replace_all(input, rule.replacement.as_str()).into_owned(),
                None => input.to_string(),
            }
        } else if rule.match_pattern.is_empty() {
            input.to_string()
        } else {
            input.replace(&rule.match_pattern, &rule.replacement)
        }
    }

    /// Rewrite a first-line payload, e.g. `GET https://a.test/x HTTP/1.1`
    /// or `HTTP/1.1 200 OK`.
    pub fn apply_first_line(
        &self,
        rules: &[MatchReplaceRule],
        scope: RewriteScope,
        line: &str,
    ) -> String {
        let mut out = line.to_string();
        for rule in Self::rules_for(rules, scope) {
            out = self.apply_text(rule, &out);
        }
        out
    }

    /// Rewrite a header list. Each header is synthesised as `Name: Value`,
    /// run through every enabled rule in index order, and reparsed. An
    /// empty result deletes the header; a result with no colon leaves the
    /// header unchanged and is logged as malformed.
    pub fn apply_headers(
        &self,
        rules: &[MatchReplaceRule],
        scope: RewriteScope,
        headers: &HeaderList,
    ) -> HeaderList {
        let scoped: Vec<&MatchReplaceRule> = Self::rules_for(rules, scope).collect();
        if scoped.is_empty() {
            return headers.clone();
        }

        let mut out = HeaderList::new();
        for header in headers.iter() {
            let original = format!("{}: {}", header.name, header.value);
            let mut line = original.clone();
            for rule in &scoped {
                line = self.apply_text(rule, &line);
            }

            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    out.push(name.trim(), value.trim_start());
                }
                None => {
                    warn!("Rewrite produced malformed header '{}', keeping original", line);
                    out.0.push(Header::new(header.name.clone(), header.value.clone()));
                }
            }
        }
        out
    }

    /// Rewrite a raw body. Literal rules splice bytes directly; regex rules
    /// run as byte regexes so non-UTF-8 bodies survive untouched elsewhere.
    pub fn apply_body(
        &self,
        rules: &[MatchReplaceRule],
        scope: RewriteScope,
        body: &[u8],
    ) -> Vec<u8> {
        let mut out = body.to_vec();
        for rule in Self::rules_for(rules, scope) {
            if rule.is_regex {
                if let Some(re) = self.byte_regex(&rule.match_pattern) {
                    out = re.replace_all(&out, rule.replacement.as_bytes()).into_owned();
                }
            } else if !rule.match_pattern.is_empty() {
                out = replace_all_bytes(&out, rule.match_pattern.as_bytes(), rule.replacement.as_bytes());
            }
        }
        out
    }
}

/// Pattern problems worth reporting back to the operator when a rule list
/// is installed. Invalid patterns never block installation; the offending
/// rules are skipped at apply time.
pub fn invalid_patterns(rules: &[MatchReplaceRule]) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.is_regex)
        .filter_map(|r| {
            Regex::new(&r.match_pattern)
                .err()
                .map(|e| format!("'{}': {}", r.match_pattern, e))
        })
        .collect()
}

fn replace_all_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}
