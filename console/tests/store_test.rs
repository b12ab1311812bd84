//! Project store integration tests against a temp directory.

use console::store::ProjectStore;
use mediator_core::exchange::{Exchange, HeaderList, ResponseRecord};
use mediator_core::exclusion::{ExclusionMatcher, ExclusionRule};
use mediator_core::rewrite::{MatchReplaceRule, RewriteScope};
use mediator_core::{ExchangeState, Project, RepeaterTab};
use tempfile::TempDir;

fn exchange(id: &str, seq: u64, url: &str) -> Exchange {
    let mut ex = Exchange::new(
        id.into(),
        seq,
        String::new(),
        "GET".into(),
        url.into(),
        HeaderList::from_pairs([("Host", "a.test"), ("Accept", "*/*")]),
        Vec::new(),
        "document".into(),
    );
    ex.response = Some(ResponseRecord {
        status: 200,
        headers: HeaderList::from_pairs([("Content-Type", "text/html")]),
        body: b"<html>\xff</html>".to_vec(),
    });
    ex.state = ExchangeState::Completed;
    ex
}

fn populated_project(name: &str) -> Project {
    let mut project = Project::new(name);
    project.upsert_exchange(exchange("a", 1, "https://a.test/1"));
    project.upsert_exchange(exchange("b", 2, "https://b.test/2"));
    project.exclusion_rules = vec![ExclusionRule::new(ExclusionMatcher::Regex(
        r"\.png$".into(),
    ))];
    project.match_replace_rules = vec![MatchReplaceRule {
        id: "r1".into(),
        enabled: true,
        scope: RewriteScope::ResponseBody,
        match_pattern: "foo".into(),
        replacement: "bar".into(),
        is_regex: false,
        comment: "swap".into(),
    }];
    project.repeater_tabs = vec![RepeaterTab {
        id: "t1".into(),
        name: "login".into(),
        request: "POST /login HTTP/1.1\r\nHost: a.test\r\n\r\nu=a".into(),
        response: "HTTP/1.1 200 OK\r\n\r\nok".into(),
    }];
    project.history_filter = "status:200".into();
    project.hide_static = true;
    project
}

#[tokio::test]
async fn save_then_load_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = ProjectStore::new(dir.path()).unwrap();

    let mut original = populated_project("roundtrip");
    store.save(&original).await.unwrap();
    let loaded = store.load("roundtrip").await.unwrap();

    // Deep-equal modulo lastModified.
    original.last_modified = loaded.last_modified;
    assert_eq!(loaded.requests, original.requests);
    assert_eq!(loaded.exclusion_rules, original.exclusion_rules);
    assert_eq!(loaded.repeater_tabs, original.repeater_tabs);
    assert_eq!(loaded.history_filter, original.history_filter);
    assert_eq!(loaded.hide_static, original.hide_static);
    assert_eq!(loaded.created, original.created);
    assert_eq!(
        serde_json::to_value(&loaded.match_replace_rules).unwrap(),
        serde_json::to_value(&original.match_replace_rules).unwrap()
    );
}

#[tokio::test]
async fn unknown_fields_survive_save() {
    let dir = TempDir::new().unwrap();
    let store = ProjectStore::new(dir.path()).unwrap();

    let raw = serde_json::json!({
        "name": "forward-compat",
        "created": "2026-01-01T00:00:00Z",
        "lastModified": "2026-01-01T00:00:00Z",
        "pluginState": {"enabled": true}
    });
    let project: Project = serde_json::from_value(raw).unwrap();
    store.save(&project).await.unwrap();

    let loaded = store.load("forward-compat").await.unwrap();
    assert_eq!(
        loaded.extra.get("pluginState"),
        Some(&serde_json::json!({"enabled": true}))
    );
}

#[tokio::test]
async fn list_and_create_and_conflicts() {
    let dir = TempDir::new().unwrap();
    let store = ProjectStore::new(dir.path()).unwrap();

    assert!(store.list().await.unwrap().is_empty());
    store.create("alpha").await.unwrap();
    store.create("beta").await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["alpha", "beta"]);

    assert!(matches!(
        store.create("alpha").await,
        Err(console::ConsoleError::AlreadyExists(_))
    ));
    assert!(matches!(
        store.load("missing").await,
        Err(console::ConsoleError::NotFound(_))
    ));
    assert!(matches!(
        store.create("../escape").await,
        Err(console::ConsoleError::InvalidName(_))
    ));
}

#[tokio::test]
async fn load_or_create_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = ProjectStore::new(dir.path()).unwrap();

    let first = store.load_or_create("work").await.unwrap();
    let again = store.load_or_create("work").await.unwrap();
    assert_eq!(first.name, again.name);
    assert_eq!(first.created, again.created);
}

#[tokio::test]
async fn retroactive_purge_persists() {
    let dir = TempDir::new().unwrap();
    let store = ProjectStore::new(dir.path()).unwrap();

    let mut project = populated_project("purge");
    project.upsert_exchange(exchange("c", 3, "https://ads.test/pixel"));
    let rules = vec![ExclusionRule::new(ExclusionMatcher::Domain("ads.test".into()))];
    assert_eq!(project.purge_excluded(&rules), 1);
    store.save(&project).await.unwrap();

    let loaded = store.load("purge").await.unwrap();
    assert_eq!(loaded.requests.len(), 2);
    assert!(loaded.requests.iter().all(|ex| !ex.url.contains("ads.test")));
}
