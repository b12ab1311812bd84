//! The persisted operator state: one named project.

use crate::exchange::Exchange;
use crate::exclusion::{is_excluded, ExclusionRule};
use crate::rewrite::MatchReplaceRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator-owned named buffer holding a raw HTTP request text and the last
/// response text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterTab {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub response: String,
}

/// Aggregate of everything persisted per project. Unknown sibling fields in
/// the document are preserved across save/load so newer clients can extend
/// the format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub requests: Vec<Exchange>,
    #[serde(default)]
    pub exclusion_rules: Vec<ExclusionRule>,
    #[serde(default)]
    pub history_filter: String,
    #[serde(default)]
    pub hide_static: bool,
    #[serde(default)]
    pub repeater_tabs: Vec<RepeaterTab>,
    #[serde(default)]
    pub match_replace_rules: Vec<MatchReplaceRule>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            created: now,
            last_modified: now,
            requests: Vec::new(),
            exclusion_rules: Vec::new(),
            history_filter: String::new(),
            hide_static: false,
            repeater_tabs: Vec::new(),
            match_replace_rules: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Append or replace the history entry for an exchange, matched by id.
    pub fn upsert_exchange(&mut self, exchange: Exchange) {
        match self.requests.iter_mut().find(|e| e.id == exchange.id) {
            Some(slot) => *slot = exchange,
            None => self.requests.push(exchange),
        }
    }

    /// Retroactive purge: remove every history entry the given rules match.
    /// Returns how many entries were removed.
    pub fn purge_excluded(&mut self, rules: &[ExclusionRule]) -> usize {
        let before = self.requests.len();
        self.requests.retain(|ex| !is_excluded(&ex.url, rules));
        before - self.requests.len()
    }

    /// Touch the modification timestamp; called by the store on save.
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::HeaderList;
    use crate::exclusion::ExclusionMatcher;

    fn exchange(id: &str, url: &str) -> Exchange {
        Exchange::new(
            id.into(),
            1,
            String::new(),
            "GET".into(),
            url.into(),
            HeaderList::new(),
            Vec::new(),
            "document".into(),
        )
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut project = Project::new("p");
        project.upsert_exchange(exchange("a", "https://a.test/1"));
        let mut updated = exchange("a", "https://a.test/1");
        updated.dropped = true;
        project.upsert_exchange(updated);

        assert_eq!(project.requests.len(), 1);
        assert!(project.requests[0].dropped);
    }

    #[test]
    fn purge_removes_all_matching_history() {
        let mut project = Project::new("p");
        project.upsert_exchange(exchange("a", "https://ads.test/1"));
        project.upsert_exchange(exchange("b", "https://app.test/2"));
        project.upsert_exchange(exchange("c", "https://ads.test/3"));

        let rules = vec![ExclusionRule::new(ExclusionMatcher::Domain("ads.test".into()))];
        assert_eq!(project.purge_excluded(&rules), 2);
        assert_eq!(project.requests.len(), 1);
        assert_eq!(project.requests[0].id, "b");
    }

    #[test]
    fn unknown_fields_round_trip() {
        let raw = r#"{
            "name": "p",
            "created": "2026-01-01T00:00:00Z",
            "lastModified": "2026-01-02T00:00:00Z",
            "requests": [],
            "futureField": {"nested": [1, 2, 3]}
        }"#;
        let project: Project = serde_json::from_str(raw).unwrap();
        let out = serde_json::to_value(&project).unwrap();
        assert_eq!(out["futureField"]["nested"][2], 3);
    }
}
