//! Gateway configuration schema

use crate::model::ChannelDraft;
use crate::relay::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration for a relay engine instance
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Schema version (required - no default)
    pub version: String,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Channels seeded into the store at startup
    #[serde(default)]
    pub channels: Vec<ChannelDraft>,
}

impl GatewayConfig {
    pub const SCHEMA_VERSION: &'static str = "0.1";

    /// Configuration with every section at its default and no channels
    pub fn minimal() -> Self {
        Self {
            version: Self::SCHEMA_VERSION.to_string(),
            relay: RelayConfig::default(),
            health: HealthConfig::default(),
            quota: QuotaConfig::default(),
            connection: ConnectionConfig::default(),
            audit: AuditConfig::default(),
            channels: Vec::new(),
        }
    }

    /// Seed channels with batched keys expanded, one draft per key
    pub fn channel_drafts(&self) -> Vec<ChannelDraft> {
        self.channels.iter().flat_map(ChannelDraft::split_keys).collect()
    }
}

/// Failover loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Upper bound on channels tried per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Bound on a single upstream exchange, stream establishment included
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_ms: u64,

    /// Backoff between failover attempts
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RelayConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            dispatch_timeout_ms: default_dispatch_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Channel auto-disable settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub auto_disable: bool,

    /// Consecutive failures that disable a channel
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            auto_disable: true,
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Inputs to the default token-ratio pricing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Flat amount reserved on top of the prompt estimate
    #[serde(default = "default_pre_consume")]
    pub pre_consume_quota: i64,

    /// Quota units per token for models without an explicit ratio
    #[serde(default = "default_ratio")]
    pub default_ratio: f64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_ratios: HashMap<String, f64>,

    /// Multiplier applied to completion tokens relative to prompt tokens
    #[serde(default = "default_ratio")]
    pub completion_ratio: f64,
}

impl QuotaConfig {
    pub fn ratio_for(&self, model: &str) -> f64 {
        self.model_ratios
            .get(model)
            .copied()
            .unwrap_or(self.default_ratio)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            pre_consume_quota: default_pre_consume(),
            default_ratio: default_ratio(),
            model_ratios: HashMap::new(),
            completion_ratio: default_ratio(),
        }
    }
}

/// Shared HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Whole-request ceiling applied by the client; dispatch timeouts may be shorter
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_idle")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_idle_per_host: default_max_idle(),
            keepalive_secs: default_keepalive(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Capacity of the channel-backed sink; events beyond it are dropped
    #[serde(default = "default_audit_buffer")]
    pub buffer: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer: default_audit_buffer(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_dispatch_timeout() -> u64 {
    60_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_pre_consume() -> i64 {
    500
}

fn default_ratio() -> f64 {
    1.0
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    300_000
}

fn default_max_idle() -> usize {
    10
}

fn default_keepalive() -> u64 {
    90
}

fn default_audit_buffer() -> usize {
    1024
}
