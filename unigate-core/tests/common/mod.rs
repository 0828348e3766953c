//! Shared fixtures for relay integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use unigate_core::adaptor::{AdaptorError, ByteStream, ProviderRequest, ProviderResponse};
use unigate_core::config::{HealthConfig, QuotaConfig, RelayConfig};
use unigate_core::http::Transport;
use unigate_core::relay::RetryPolicy;
use unigate_core::{ChannelDraft, ChannelStore, MemoryStore, ProviderType, Token, TokenStore};

/// Route relay logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Canned upstream behavior for one host
#[derive(Clone)]
pub enum Reply {
    Json(String),
    Fail(AdaptorError),
    Events(Vec<String>),
    EventsThenFail(Vec<String>, AdaptorError),
    /// Never answers
    Hang,
}

/// Transport answering from a per-host script and recording every call
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, host: &str, reply: Reply) {
        self.routes.lock().insert(host.to_string(), reply);
    }

    /// Hosts called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn reply_for(&self, request: &ProviderRequest) -> Result<Reply, AdaptorError> {
        let host = url::Url::parse(&request.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();
        self.calls.lock().push(host.clone());
        self.routes
            .lock()
            .get(&host)
            .cloned()
            .ok_or_else(|| AdaptorError::Connect(format!("no route to {}", host)))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: ProviderRequest,
        _timeout: Duration,
    ) -> Result<ProviderResponse, AdaptorError> {
        match self.reply_for(&request)? {
            Reply::Json(body) => Ok(ProviderResponse::json(body)),
            Reply::Fail(e) => Err(e),
            Reply::Hang => futures::future::pending().await,
            Reply::Events(_) | Reply::EventsThenFail(..) => {
                Err(AdaptorError::Protocol("unexpected event stream".to_string()))
            }
        }
    }

    async fn open_stream(
        &self,
        request: ProviderRequest,
        _timeout: Duration,
    ) -> Result<ByteStream, AdaptorError> {
        let (frames, tail) = match self.reply_for(&request)? {
            Reply::Events(frames) => (frames, None),
            Reply::EventsThenFail(frames, e) => (frames, Some(e)),
            Reply::Fail(e) => return Err(e),
            Reply::Hang => return futures::future::pending().await,
            Reply::Json(_) => return Err(AdaptorError::Protocol("expected a stream".to_string())),
        };
        let items: Vec<Result<Bytes, AdaptorError>> = frames
            .into_iter()
            .map(|frame| Ok(Bytes::from(frame)))
            .chain(tail.map(Err))
            .collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

pub fn openai_completion(text: &str, prompt_tokens: u32, completion_tokens: u32) -> String {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-4o-2024",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
    .to_string()
}

pub fn openai_delta_frame(text: &str) -> String {
    let chunk = json!({
        "id": "chatcmpl-stream",
        "created": 1_700_000_000,
        "model": "gpt-4o-2024",
        "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": null }]
    });
    format!("data: {}\n\n", chunk)
}

pub fn openai_usage_frame(prompt_tokens: u32, completion_tokens: u32) -> String {
    let chunk = json!({
        "id": "chatcmpl-stream",
        "created": 1_700_000_000,
        "model": "gpt-4o-2024",
        "choices": [],
        "usage": { "prompt_tokens": prompt_tokens, "completion_tokens": completion_tokens }
    });
    format!("data: {}\n\n", chunk)
}

pub fn done_frame() -> String {
    "data: [DONE]\n\n".to_string()
}

/// OpenAI channel serving `gpt-4o` from `http://{host}`
pub fn openai_channel(host: &str, priority: i64, weight: u32) -> ChannelDraft {
    ChannelDraft::new(host, ProviderType::OpenAI, format!("sk-{}-secret-key", host))
        .with_base_url(format!("http://{}", host))
        .with_models(["gpt-4o"])
        .with_priority(priority)
        .with_weight(weight)
}

/// Flat pricing: 10 quota reserved per request, 1 quota per token after
pub fn flat_quota() -> QuotaConfig {
    QuotaConfig {
        pre_consume_quota: 10,
        default_ratio: 1.0,
        model_ratios: HashMap::new(),
        completion_ratio: 1.0,
    }
}

pub fn fast_relay(max_attempts: u32) -> RelayConfig {
    RelayConfig {
        max_attempts,
        dispatch_timeout_ms: 2_000,
        retry: RetryPolicy::immediate(),
    }
}

pub fn health(threshold: u32) -> HealthConfig {
    HealthConfig {
        auto_disable: true,
        failure_threshold: threshold,
    }
}

pub async fn seed_token(store: &MemoryStore, quota: i64) -> Token {
    let id = store
        .insert_token(Token::new(1, "caller", "tok-caller-key").with_quota(quota))
        .await
        .unwrap();
    store.get_token(id).await.unwrap().unwrap()
}

pub async fn seed_channels(store: &MemoryStore, drafts: Vec<ChannelDraft>) -> Vec<i64> {
    store.insert_channels(drafts).await.unwrap()
}

pub fn shared(store: &Arc<MemoryStore>) -> (Arc<dyn ChannelStore>, Arc<dyn TokenStore>) {
    (store.clone(), store.clone())
}
