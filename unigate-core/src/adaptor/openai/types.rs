//! OpenAI chat-completions wire types
//!
//! Requests borrow from the canonical request since the shapes already agree;
//! responses are decoded leniently because OpenAI-compatible upstreams often
//! omit fields the official API always sends.

use crate::protocol::{Message, MessageDelta, ToolDefinition};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct OpenAIRequest<'a> {
    pub model: &'a str,

    pub messages: &'a [Message],

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<&'a [String]>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<OpenAIStreamOptions>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [ToolDefinition]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<&'a serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
}

/// Asks the upstream to append a usage-only chunk before `[DONE]`
#[derive(Debug, Clone, Serialize)]
pub struct OpenAIStreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResponse {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub created: i64,

    #[serde(default)]
    pub model: String,

    pub choices: Vec<OpenAIChoice>,

    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    #[serde(default)]
    pub index: u32,

    pub message: Message,

    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OpenAIUsage {
    #[serde(default)]
    pub prompt_tokens: u32,

    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIStreamChunk {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub created: i64,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub choices: Vec<OpenAIStreamChoice>,

    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIStreamChoice {
    #[serde(default)]
    pub index: u32,

    #[serde(default)]
    pub delta: MessageDelta,

    #[serde(default)]
    pub finish_reason: Option<String>,
}
