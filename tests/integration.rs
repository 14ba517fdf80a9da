//! Integration tests for the mutation engine.

use async_trait::async_trait;
use auth_mutator::{
    apply_rules, strip_credentials, EngineConfig, HostClient, InterceptHandler, RequestAction,
    HttpService, RequestSnapshot, ResponseSnapshot, ToolKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Configuration Parsing Tests
// =============================================================================

#[test]
fn test_parse_minimal_config() {
    let yaml = r#"
version: "1"
rules: []
"#;
    let config = EngineConfig::from_yaml(yaml).unwrap();
    assert_eq!(config.version, "1");
    assert!(config.rules.is_empty());
    assert!(!config.settings.enabled);
}

#[test]
fn test_parse_full_config() {
    let yaml = r#"
version: "1"
settings:
  enabled: true
  only_in_scope: true
  unauthenticated_testing: true
  apply_rules_to_unauth: true
  max_log_entries: 250
  shutdown_grace_ms: 2000

rules:
  - name: "act-as-viewer"
    enabled: true
    operations:
      - kind: set_cookie_value_by_name
        match: { pattern: "session" }
        value: "viewer-token"
      - kind: remove_header_by_name
        match: { pattern: "X-Admin" }
    target_role: "viewer"

highlight_rules:
  - name: "unauth-succeeded"
    color: "red"
    operator: all
    conditions:
      - part: status_code
        relationship: less_than
        value: "400"

roles:
  - name: "viewer"
    enabled: true
    tokens:
      - kind: cookie
        name: "session"
        value: "viewer-token"
"#;
    let config = EngineConfig::from_yaml(yaml).unwrap();
    assert!(config.settings.enabled);
    assert!(config.settings.only_in_scope);
    assert_eq!(config.settings.max_log_entries, 250);
    assert_eq!(config.settings.shutdown_grace_ms, 2000);
    assert_eq!(config.rules.len(), 1);
    assert_eq!(config.rules[0].operations.len(), 2);
    assert_eq!(config.rules[0].target_role.as_deref(), Some("viewer"));
    assert_eq!(config.highlight_rules.len(), 1);
    assert_eq!(config.roles[0].name, "viewer");
}

#[test]
fn test_parse_json_config() {
    let json_str = r#"{
        "version": "1",
        "settings": { "enabled": true },
        "rules": [
            {
                "name": "strip-admin",
                "operations": [
                    { "kind": "remove_header_by_name", "match": { "pattern": "X-Admin" } }
                ]
            }
        ]
    }"#;
    let config = EngineConfig::from_json(json_str).unwrap();
    assert_eq!(config.rules.len(), 1);
    assert_eq!(config.rules[0].name, "strip-admin");
}

#[test]
fn test_invalid_regex_rejected_at_load() {
    let yaml = r#"
rules:
  - name: "broken"
    operations:
      - kind: rewrite_body
        match: { pattern: "([", regex: true }
        replace: "x"
"#;
    assert!(EngineConfig::from_yaml(yaml).is_err());
}

// =============================================================================
// Rule Engine End-to-End Tests
// =============================================================================

fn sample_request() -> RequestSnapshot {
    RequestSnapshot::build(
        HttpService::new("api.example.com", 443, true),
        "POST",
        "/v1/orders?debug=1",
        vec![
            ("Host", "api.example.com"),
            ("Content-Type", "application/x-www-form-urlencoded"),
            ("Cookie", "session=admin-token; theme=dark"),
            ("X-Admin", "true"),
        ]
        .into_iter()
        .map(|(n, v)| auth_mutator::message::Header::new(n, v))
        .collect(),
        "item=widget&qty=2",
    )
}

#[test]
fn test_multi_operation_rule() {
    let yaml = r#"
rules:
  - name: "downgrade"
    operations:
      - kind: set_cookie_value_by_name
        match: { pattern: "session" }
        value: "viewer-token"
      - kind: remove_header_by_name
        match: { pattern: "X-Admin" }
      - kind: remove_param_by_name
        match: { pattern: "debug" }
"#;
    let config = EngineConfig::from_yaml(yaml).unwrap();
    let (rewritten, changed) = apply_rules(&sample_request(), &config.rules);
    assert!(changed);
    assert_eq!(
        rewritten.header_value("cookie"),
        Some("session=viewer-token; theme=dark")
    );
    assert_eq!(rewritten.header_value("x-admin"), None);
    assert_eq!(rewritten.query(), None);
    // body params untouched
    assert_eq!(rewritten.body(), "item=widget&qty=2");
}

#[test]
fn test_disabled_rule_is_skipped() {
    let yaml = r#"
rules:
  - name: "off"
    enabled: false
    operations:
      - kind: remove_header_by_name
        match: { pattern: "X-Admin" }
"#;
    let config = EngineConfig::from_yaml(yaml).unwrap();
    let (rewritten, changed) = apply_rules(&sample_request(), &config.rules);
    assert!(!changed);
    assert_eq!(rewritten.to_text(), sample_request().to_text());
}

#[test]
fn test_unauth_variant_after_rules() {
    let yaml = r#"
rules:
  - name: "mark"
    operations:
      - kind: rewrite_header
        match: { pattern: "" }
        replace: "X-Test-Run: auth-check"
"#;
    let config = EngineConfig::from_yaml(yaml).unwrap();
    let (rewritten, changed) = apply_rules(&sample_request(), &config.rules);
    assert!(changed);
    let variant = strip_credentials(&rewritten).expect("request has cookies");
    assert_eq!(variant.header_value("x-test-run"), Some("auth-check"));
    assert_eq!(variant.header_value("cookie"), None);
}

// =============================================================================
// Mock Hosts
// =============================================================================

struct MockHost {
    status: u16,
    delay: Option<Duration>,
    fail: bool,
    in_scope: bool,
    sends: AtomicUsize,
}

impl MockHost {
    fn responding(status: u16) -> Self {
        Self {
            status,
            delay: None,
            fail: false,
            in_scope: true,
            sends: AtomicUsize::new(0),
        }
    }

    fn delayed(status: u16, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::responding(status)
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::responding(0)
        }
    }
}

#[async_trait]
impl HostClient for MockHost {
    async fn send_request(
        &self,
        _request: &RequestSnapshot,
    ) -> anyhow::Result<Option<ResponseSnapshot>> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("origin unreachable");
        }
        Ok(Some(ResponseSnapshot::of(self.status, "synthetic")))
    }

    fn is_in_scope(&self, _url: &str) -> bool {
        self.in_scope
    }
}

fn unauth_config() -> EngineConfig {
    EngineConfig::from_yaml(
        r#"
settings:
  enabled: true
  unauthenticated_testing: true
"#,
    )
    .unwrap()
}

// =============================================================================
// Handler End-to-End Tests
// =============================================================================

#[tokio::test]
async fn test_direct_mode_merges_late_synthetic_response() {
    // the synthetic unauth response lands after the live response is logged
    let host = Arc::new(MockHost::delayed(401, Duration::from_millis(50)));
    let handler = InterceptHandler::new(host.clone(), unauth_config());

    let action = handler
        .on_request(1, ToolKind::Repeater, sample_request())
        .await;
    assert_eq!(action, RequestAction::Continue);
    handler.on_response(1, ResponseSnapshot::of(200, "live")).await;
    handler.shutdown().await;

    let entries = handler.store().entries().await;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(
        entry.original_response.as_ref().map(|r| r.status_code()),
        Some(200)
    );
    assert_eq!(
        entry.unauth_response.as_ref().map(|r| r.status_code()),
        Some(401)
    );
    assert_eq!(host.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_direct_mode_merges_early_synthetic_response() {
    // the synthetic response lands before the live one
    let host = Arc::new(MockHost::responding(401));
    let handler = InterceptHandler::new(host, unauth_config());

    handler
        .on_request(1, ToolKind::Repeater, sample_request())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handler.on_response(1, ResponseSnapshot::of(200, "live")).await;
    handler.shutdown().await;

    let entry = handler.store().entries().await.remove(0);
    assert_eq!(
        entry.original_response.as_ref().map(|r| r.status_code()),
        Some(200)
    );
    assert_eq!(
        entry.unauth_response.as_ref().map(|r| r.status_code()),
        Some(401)
    );
}

#[tokio::test]
async fn test_preview_synthetic_failure_leaves_response_absent() {
    let host = Arc::new(MockHost::failing());
    let config = EngineConfig::from_yaml(
        r#"
settings:
  enabled: true
rules:
  - name: "mark"
    operations:
      - kind: rewrite_header
        match: { pattern: "" }
        replace: "X-Test-Run: auth-check"
"#,
    )
    .unwrap();
    let handler = InterceptHandler::new(host, config);

    let action = handler
        .on_request(5, ToolKind::Proxy, sample_request())
        .await;
    assert_eq!(action, RequestAction::Continue);
    handler.on_response(5, ResponseSnapshot::of(200, "live")).await;
    handler.shutdown().await;

    let entry = handler.store().entries().await.remove(0);
    assert!(entry.modified_request.is_some());
    assert!(entry.modified_response.is_none());
    assert_eq!(
        entry.original_response.as_ref().map(|r| r.status_code()),
        Some(200)
    );
    // entry status falls back to the live response
    assert_eq!(entry.status_code(), 200);
}

async fn preview_with_unauth_scenario(
    host: Arc<MockHost>,
    settle_before_live: bool,
) -> Arc<auth_mutator::LogEntry> {
    let config = EngineConfig::from_yaml(
        r#"
settings:
  enabled: true
  unauthenticated_testing: true
rules:
  - name: "mark"
    operations:
      - kind: rewrite_header
        match: { pattern: "" }
        replace: "X-Test-Run: auth-check"
"#,
    )
    .unwrap();
    let handler = InterceptHandler::new(host, config);

    let action = handler.on_request(11, ToolKind::Proxy, sample_request()).await;
    assert_eq!(action, RequestAction::Continue);
    if settle_before_live {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handler.on_response(11, ResponseSnapshot::of(200, "live")).await;
    handler.shutdown().await;

    let entries = handler.store().entries().await;
    assert_eq!(entries.len(), 1);
    entries.into_iter().next().unwrap()
}

fn assert_fully_correlated(entry: &auth_mutator::LogEntry, synthetic_status: u16) {
    assert!(entry.modified_request.is_some());
    assert!(entry.unauth_request.is_some());
    assert!(entry.unauth_testing);
    assert!(!entry.modified_sent);
    assert_eq!(
        entry.original_response.as_ref().map(|r| r.status_code()),
        Some(200)
    );
    assert_eq!(
        entry.modified_response.as_ref().map(|r| r.status_code()),
        Some(synthetic_status)
    );
    assert_eq!(
        entry.unauth_response.as_ref().map(|r| r.status_code()),
        Some(synthetic_status)
    );
    // live response stays authoritative for the entry status
    assert_eq!(entry.status_code(), 200);
}

#[tokio::test]
async fn test_preview_and_unauth_with_synthetics_after_live_response() {
    // both synthetic sends resolve after the live response has merged
    let host = Arc::new(MockHost::delayed(401, Duration::from_millis(50)));
    let entry = preview_with_unauth_scenario(host.clone(), false).await;
    assert_fully_correlated(&entry, 401);
    assert_eq!(host.sends.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_preview_and_unauth_with_synthetics_before_live_response() {
    // both synthetic sends resolve before the live response arrives
    let host = Arc::new(MockHost::responding(401));
    let entry = preview_with_unauth_scenario(host.clone(), true).await;
    assert_fully_correlated(&entry, 401);
    assert_eq!(host.sends.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_grace_abandons_slow_sends() {
    let host = Arc::new(MockHost::delayed(401, Duration::from_secs(30)));
    let mut config = unauth_config();
    config.settings.shutdown_grace_ms = 100;
    let handler = InterceptHandler::new(host, config);

    handler
        .on_request(1, ToolKind::Repeater, sample_request())
        .await;
    handler.on_response(1, ResponseSnapshot::of(200, "live")).await;

    let start = Instant::now();
    handler.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(5));

    let entry = handler.store().entries().await.remove(0);
    assert!(entry.unauth_response.is_none());
}

#[tokio::test]
async fn test_unauth_variant_follows_rewritten_request() {
    let host = Arc::new(MockHost::responding(401));
    let config = EngineConfig::from_yaml(
        r#"
settings:
  enabled: true
  unauthenticated_testing: true
  apply_rules_to_unauth: true
rules:
  - name: "mark"
    operations:
      - kind: rewrite_header
        match: { pattern: "" }
        replace: "X-Test-Run: auth-check"
"#,
    )
    .unwrap();
    let handler = InterceptHandler::new(host, config);

    let action = handler
        .on_request(2, ToolKind::Repeater, sample_request())
        .await;
    assert!(matches!(action, RequestAction::ContinueWith(_)));
    handler.on_response(2, ResponseSnapshot::of(200, "live")).await;
    handler.shutdown().await;

    let entry = handler.store().entries().await.remove(0);
    let unauth = entry.unauth_request.as_ref().expect("variant derived");
    assert_eq!(unauth.header_value("x-test-run"), Some("auth-check"));
    assert_eq!(unauth.header_value("cookie"), None);
    // live response went with the rewritten request
    assert!(entry.modified_sent);
    assert_eq!(
        entry.modified_response.as_ref().map(|r| r.status_code()),
        Some(200)
    );
}

#[tokio::test]
async fn test_highlight_rules_color_completed_entries() {
    let host = Arc::new(MockHost::responding(200));
    let config = EngineConfig::from_yaml(
        r#"
settings:
  enabled: true
  unauthenticated_testing: true
highlight_rules:
  - name: "unauth-succeeded"
    color: "red"
    conditions:
      - part: status_code
        relationship: less_than
        value: "400"
"#,
    )
    .unwrap();
    let handler = InterceptHandler::new(host, config);

    handler
        .on_request(1, ToolKind::Repeater, sample_request())
        .await;
    handler.on_response(1, ResponseSnapshot::of(200, "ok")).await;
    handler.shutdown().await;

    let entry = handler.store().entries().await.remove(0);
    assert_eq!(handler.highlight_color(&entry), Some("red".to_string()));
}

#[tokio::test]
async fn test_log_store_stays_bounded() {
    let host = Arc::new(MockHost::responding(401));
    let mut config = unauth_config();
    config.settings.max_log_entries = 100;
    let handler = InterceptHandler::new(host, config);

    for i in 0..120 {
        handler
            .on_request(i, ToolKind::Repeater, sample_request())
            .await;
        handler.on_response(i, ResponseSnapshot::of(200, "ok")).await;
    }
    handler.shutdown().await;

    assert_eq!(handler.store().len().await, 100);
    assert_eq!(handler.stats().requests_seen, 120);
}
