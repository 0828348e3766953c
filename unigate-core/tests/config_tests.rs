//! Integration tests for configuration loading and validation

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use chrono::Utc;
use unigate_core::audit::{AuditEvent, AuditOutcome, AuditSink, ChannelAuditSink};
use unigate_core::config::{load_from_json, load_from_yaml, ConfigError, ValidationErrorKind};
use unigate_core::relay::RetryPolicy;
use unigate_core::{ChannelStore, MemoryStore, ProviderType, Relay};

/// Helper to create a test config file
fn create_test_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_full_yaml_config() {
    env::set_var("UNIGATE_YAML_OPENAI_KEY", "sk-yaml-1");

    let yaml = r#"
version: "0.1"
relay:
  max_attempts: 4
  dispatch_timeout_ms: 30000
  retry:
    initial_delay_ms: 50
    max_delay_ms: 1000
health:
  failure_threshold: 5
quota:
  pre_consume_quota: 200
  model_ratios:
    gpt-4o: 2.5
channels:
  - name: openai-main
    type: openai
    key: ${UNIGATE_YAML_OPENAI_KEY}
    models: [gpt-4o, gpt-4o-mini]
    priority: 10
    weight: 3
  - name: claude
    type: anthropic
    key: sk-ant-static
    base_url: https://proxy.internal.example
    models: [claude-3-5-sonnet]
    model_mapping:
      claude-3-5-sonnet: claude-3-5-sonnet-20241022
"#;

    let dir = TempDir::new().unwrap();
    let config = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap();

    assert_eq!(config.relay.max_attempts, 4);
    assert_eq!(
        config.relay.retry,
        RetryPolicy {
            initial_delay_ms: 50,
            max_delay_ms: 1000,
            ..RetryPolicy::default()
        }
    );
    assert_eq!(config.health.failure_threshold, 5);
    assert!(config.health.auto_disable);
    assert_eq!(config.quota.ratio_for("gpt-4o"), 2.5);
    assert_eq!(config.quota.ratio_for("gpt-4o-mini"), 1.0);

    assert_eq!(config.channels.len(), 2);
    assert_eq!(config.channels[0].key.expose_secret(), "sk-yaml-1");
    assert_eq!(config.channels[0].weight, 3);
    assert_eq!(config.channels[1].provider_type, ProviderType::Anthropic);
    assert_eq!(config.channels[1].weight, 1);

    env::remove_var("UNIGATE_YAML_OPENAI_KEY");
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "version": "0.1",
        "channels": [
            { "name": "gemini", "type": "gemini", "key": "gm-key", "models": ["gemini-1.5-pro"] }
        ]
    }"#;

    let dir = TempDir::new().unwrap();
    let config = load_from_json(create_test_file(&dir, "gateway.json", json)).unwrap();

    assert_eq!(config.relay.max_attempts, 3);
    assert_eq!(config.channels[0].provider_type, ProviderType::Gemini);
}

#[test]
fn test_missing_env_var_is_reported() {
    let yaml = r#"
version: "0.1"
channels:
  - name: openai
    type: openai
    key: ${UNIGATE_DEFINITELY_UNSET_VAR}
    models: [gpt-4o]
"#;
    let dir = TempDir::new().unwrap();
    let err = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap_err();

    match err {
        ConfigError::EnvVarNotFound { var } => assert_eq!(var, "UNIGATE_DEFINITELY_UNSET_VAR"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_parse_error_carries_location() {
    let dir = TempDir::new().unwrap();
    let path = create_test_file(&dir, "broken.yaml", "version: \"0.1\"\nrelay: [unclosed\n");

    match load_from_yaml(path).unwrap_err() {
        ConfigError::ParseError { line, .. } => assert!(line.is_some()),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_unknown_field_rejected() {
    let yaml = "version: \"0.1\"\nrelay:\n  max_attempt: 3\n";
    let dir = TempDir::new().unwrap();
    let err = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

#[test]
fn test_validation_reports_field_path() {
    let yaml = r#"
version: "0.1"
channels:
  - name: a
    type: openai
    key: sk-a
    models: [gpt-4o]
  - name: b
    type: openai
    key: sk-b
    models: ["  "]
"#;
    let dir = TempDir::new().unwrap();
    let err = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap_err();

    let ConfigError::ValidationError(validation) = err else {
        panic!("expected a validation error");
    };
    assert_eq!(validation.field_path, "channels[1].models");
    assert!(matches!(
        validation.kind,
        ValidationErrorKind::RequiredFieldMissing
    ));
}

#[test]
fn test_invalid_retry_policy_rejected() {
    let yaml = r#"
version: "0.1"
relay:
  retry:
    jitter_factor: 1.5
"#;
    let dir = TempDir::new().unwrap();
    let err = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap_err();

    let ConfigError::ValidationError(validation) = err else {
        panic!("expected a validation error");
    };
    assert_eq!(validation.field_path, "relay.retry.jitter_factor");
}

#[test]
fn test_config_debug_hides_channel_keys() {
    let yaml = r#"
version: "0.1"
channels:
  - name: openai
    type: openai
    key: sk-very-secret-value
    models: [gpt-4o]
"#;
    let dir = TempDir::new().unwrap();
    let config = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap();

    let debug = format!("{:?}", config);
    assert!(!debug.contains("sk-very-secret-value"));
    assert!(debug.contains("[REDACTED]"));
}

#[tokio::test]
async fn test_batched_keys_seed_one_channel_each() {
    let yaml = r#"
version: "0.1"
channels:
  - name: pool
    type: openai
    key: |
      sk-pool-1
      sk-pool-2

      sk-pool-3
    models: [gpt-4o]
"#;
    let dir = TempDir::new().unwrap();
    let config = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap();

    let drafts = config.channel_drafts();
    assert_eq!(drafts.len(), 3);
    assert_eq!(drafts[2].key.expose_secret(), "sk-pool-3");

    let store = Arc::new(MemoryStore::new());
    store.insert_channels(config.channels.clone()).await.unwrap();
    assert_eq!(store.channels_for_capability("gpt-4o").await.unwrap().len(), 3);

    let relay = Relay::from_config(&config, store.clone(), store.clone()).unwrap();
    assert_eq!(relay.ledger().open_reservations(), 0);
}

#[tokio::test]
async fn test_audit_buffer_sizes_channel_sink() {
    let yaml = "version: \"0.1\"\naudit:\n  buffer: 2\n";
    let dir = TempDir::new().unwrap();
    let config = load_from_yaml(create_test_file(&dir, "gateway.yaml", yaml)).unwrap();

    let (sink, mut receiver) = ChannelAuditSink::from_config(&config.audit);
    for attempt in 1..=3 {
        sink.record(AuditEvent {
            timestamp: Utc::now(),
            request_id: "req-audit".to_string(),
            token_id: 1,
            channel_id: 1,
            capability: "gpt-4o".to_string(),
            attempt,
            stream: false,
            outcome: AuditOutcome::Succeeded,
            cost_delta: 0,
            usage: None,
            latency_ms: 1,
        });
    }

    assert_eq!(sink.dropped(), 1);
    assert_eq!(receiver.recv().await.unwrap().attempt, 1);
    assert_eq!(receiver.recv().await.unwrap().attempt, 2);
}
