//! Google Gemini (Generative Language API)

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
use types::GeminiResponse;

#[derive(Debug, Clone, Default)]
pub struct GeminiAdaptor;

impl GeminiAdaptor {
    pub fn new() -> Self {
        Self
    }
}

/// `generateContent` path for `model`, or its SSE streaming variant
pub fn model_path(model: &str, stream: bool) -> String {
    if stream {
        format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model)
    } else {
        format!("/v1beta/models/{}:generateContent", model)
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        channel: &Channel,
    ) -> AdaptorResult<ProviderRequest> {
        let upstream_model = channel.upstream_model(&request.model);
        let body = serde_json::to_value(converter::to_gemini_request(request)?)?;
        let url = endpoint_url(channel, &model_path(upstream_model, request.stream))?;

        ProviderRequest::post_json(url, body, request.stream)
            .with_secret_header("x-goog-api-key", channel.key.expose_secret())
    }

    fn parse_response(&self, response: ProviderResponse) -> AdaptorResult<(ChatResponse, Usage)> {
        let decoded: GeminiResponse = serde_json::from_slice(&response.body)?;
        converter::from_gemini_response(decoded)
    }

    fn parse_stream(&self, body: ByteStream) -> ChatStream {
        streaming::parse_stream(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelDraft;
    use crate::protocol::Message;
    use chrono::Utc;

    fn channel() -> Channel {
        ChannelDraft::new("g", ProviderType::Gemini, "AIza-test-key")
            .with_model_mapping("gemini", "gemini-1.5-pro")
            .into_channel(3, Utc::now())
    }

    #[test]
    fn test_stream_url_and_key_header() {
        let request = ChatRequest::new("gemini", vec![Message::user("hi")]).with_streaming();
        let built = GeminiAdaptor::new().build_request(&request, &channel()).unwrap();

        assert_eq!(
            built.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
        );
        assert!(built.headers.get("x-goog-api-key").unwrap().is_sensitive());
        assert!(!built.url.contains("AIza"));
        assert_eq!(built.body["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello"}, {"text": " world"}]},
                "finishReason": "MAX_TOKENS",
                "index": 0
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5},
            "modelVersion": "gemini-1.5-pro-002",
            "responseId": "resp-1"
        }"#;
        let (response, usage) = GeminiAdaptor::new()
            .parse_response(ProviderResponse::json(body))
            .unwrap();
        assert_eq!(response.id, "resp-1");
        assert_eq!(response.first_text().as_deref(), Some("Hello world"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(usage, Usage::new(3, 2));
    }
}
