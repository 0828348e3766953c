//! Anthropic Messages API

pub mod converter;
pub mod streaming;
pub mod types;

use super::{
    endpoint_url, Adaptor, AdaptorResult, ByteStream, ChatStream, ProviderRequest,
    ProviderResponse,
};
use crate::model::{Channel, ProviderType};
use crate::protocol::{ChatRequest, ChatResponse, Usage};
use async_trait::async_trait;
use types::AnthropicResponse;

pub const MESSAGES_PATH: &str = "/v1/messages";

pub const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Default)]
pub struct AnthropicAdaptor;

impl AnthropicAdaptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        channel: &Channel,
    ) -> AdaptorResult<ProviderRequest> {
        let upstream_model = channel.upstream_model(&request.model);
        let converted = converter::to_anthropic_request(request, upstream_model)?;
        let body = serde_json::to_value(converted)?;

        ProviderRequest::post_json(endpoint_url(channel, MESSAGES_PATH)?, body, request.stream)
            .with_secret_header("x-api-key", channel.key.expose_secret())?
            .with_header("anthropic-version", API_VERSION)
    }

    fn parse_response(&self, response: ProviderResponse) -> AdaptorResult<(ChatResponse, Usage)> {
        let decoded: AnthropicResponse = serde_json::from_slice(&response.body)?;
        Ok(converter::from_anthropic_response(decoded))
    }

    fn parse_stream(&self, body: ByteStream) -> ChatStream {
        streaming::parse_stream(body)
    }
}
