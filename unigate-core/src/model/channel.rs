//! Channel records: operator-configured upstream backends

use crate::config::SecretString;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub type ChannelId = i64;

/// Wire protocol family spoken by a channel's upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI chat completions, and any upstream that mimics it
    OpenAI,
    Anthropic,
    Gemini,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Gemini => "gemini",
        }
    }

    /// Public endpoint used when a channel has no base URL override
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "https://api.openai.com",
            ProviderType::Anthropic => "https://api.anthropic.com",
            ProviderType::Gemini => "https://generativelanguage.googleapis.com",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderType::OpenAI),
            "anthropic" => Ok(ProviderType::Anthropic),
            "gemini" => Ok(ProviderType::Gemini),
            other => Err(format!("unknown provider type '{}'", other)),
        }
    }
}

/// Channel lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    /// Disabled by the relay engine after repeated failures
    AutoDisabled,
}

impl ChannelStatus {
    pub fn code(&self) -> u8 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ChannelStatus::Enabled),
            2 => Some(ChannelStatus::ManuallyDisabled),
            3 => Some(ChannelStatus::AutoDisabled),
            _ => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        !matches!(self, ChannelStatus::Enabled)
    }
}

/// A persisted channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,

    pub name: String,

    pub provider_type: ProviderType,

    /// Upstream credential
    pub key: SecretString,

    /// Overrides [`ProviderType::default_base_url`]
    pub base_url: Option<String>,

    /// Capabilities this channel serves
    pub models: Vec<String>,

    /// Requested model -> upstream model rename
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,

    pub status: ChannelStatus,

    /// Higher values are tried first
    pub priority: i64,

    /// Relative selection probability within a priority tier
    pub weight: u32,

    /// Consecutive relay failures since the last success
    pub failure_count: u32,

    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// Enabled and carrying a usable credential
    pub fn is_eligible(&self) -> bool {
        self.status == ChannelStatus::Enabled && !self.key.is_blank()
    }

    /// Weight used for selection; zero is promoted to one
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.provider_type.default_base_url())
            .trim_end_matches('/')
    }

    /// Model name to send upstream for a requested capability
    pub fn upstream_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mapping
            .get(requested)
            .map(String::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(requested)
    }
}

/// Model list with duplicates and blanks removed, order preserved
pub fn normalize_models<S: AsRef<str>>(models: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    models
        .iter()
        .map(|m| m.as_ref().trim().to_string())
        .filter(|m| !m.is_empty() && seen.insert(m.clone()))
        .collect()
}

/// Operator submission that may expand into several channels.
///
/// `key` may hold several newline-separated credentials; each non-blank line
/// becomes its own channel sharing every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelDraft {
    pub name: String,

    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    pub key: SecretString,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default)]
    pub model_mapping: HashMap<String, String>,

    #[serde(default)]
    pub priority: i64,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_status")]
    pub status: ChannelStatus,
}

fn default_weight() -> u32 {
    1
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Enabled
}

impl ChannelDraft {
    pub fn new(
        name: impl Into<String>,
        provider_type: ProviderType,
        key: impl Into<SecretString>,
    ) -> Self {
        Self {
            name: name.into(),
            provider_type,
            key: key.into(),
            base_url: None,
            models: Vec::new(),
            model_mapping: HashMap::new(),
            priority: 0,
            weight: default_weight(),
            status: default_status(),
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    /// One draft per non-blank key line
    pub fn split_keys(&self) -> Vec<ChannelDraft> {
        self.key
            .expose_secret()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| ChannelDraft {
                key: SecretString::new(line),
                ..self.clone()
            })
            .collect()
    }

    pub fn normalized_models(&self) -> Vec<String> {
        normalize_models(&self.models)
    }

    /// Materialize a single-key draft into a channel record
    pub fn into_channel(self, id: ChannelId, created_at: DateTime<Utc>) -> Channel {
        let models = self.normalized_models();
        Channel {
            id,
            name: self.name,
            provider_type: self.provider_type,
            key: self.key,
            base_url: self.base_url,
            models,
            model_mapping: self.model_mapping,
            status: self.status,
            priority: self.priority,
            weight: self.weight,
            failure_count: 0,
            created_at,
        }
    }
}
