//! OpenAI chat completions, also used for any OpenAI-compatible base URL

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
use types::OpenAIResponse;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone, Default)]
pub struct OpenAIAdaptor;

impl OpenAIAdaptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAI
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        channel: &Channel,
    ) -> AdaptorResult<ProviderRequest> {
        let upstream_model = channel.upstream_model(&request.model);
        let body = serde_json::to_value(converter::to_openai_request(request, upstream_model))?;
        let bearer = format!("Bearer {}", channel.key.expose_secret());

        ProviderRequest::post_json(
            endpoint_url(channel, CHAT_COMPLETIONS_PATH)?,
            body,
            request.stream,
        )
        .with_secret_header("authorization", &bearer)
    }

    fn parse_response(&self, response: ProviderResponse) -> AdaptorResult<(ChatResponse, Usage)> {
        let decoded: OpenAIResponse = serde_json::from_slice(&response.body)?;
        Ok(converter::from_openai_response(decoded))
    }

    fn parse_stream(&self, body: ByteStream) -> ChatStream {
        streaming::parse_stream(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::AdaptorError;
    use crate::model::ChannelDraft;
    use crate::protocol::Message;
    use bytes::Bytes;
    use chrono::Utc;
    use futures::{stream, StreamExt};

    fn channel() -> Channel {
        ChannelDraft::new("oa", ProviderType::OpenAI, "sk-test-000000000")
            .with_base_url("https://gateway.example.com/")
            .with_model_mapping("gpt-4o", "gpt-4o-2024-08-06")
            .into_channel(1, Utc::now())
    }

    #[test]
    fn test_build_request_maps_model_and_auth() {
        let request = ChatRequest::new("gpt-4o", vec![Message::user("hi")]).with_streaming();
        let built = OpenAIAdaptor::new().build_request(&request, &channel()).unwrap();

        assert_eq!(built.url, "https://gateway.example.com/v1/chat/completions");
        assert_eq!(built.body["model"], "gpt-4o-2024-08-06");
        assert_eq!(built.body["stream"], true);
        assert_eq!(built.body["stream_options"]["include_usage"], true);
        assert_eq!(
            built.headers.get("authorization").unwrap(),
            "Bearer sk-test-000000000"
        );
        assert!(built.stream);
    }

    #[test]
    fn test_parse_response_with_tool_call() {
        let body = r#"{
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\":1}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        }"#;
        let (response, usage) = OpenAIAdaptor::new()
            .parse_response(ProviderResponse::json(body))
            .unwrap();
        assert_eq!(usage, Usage::new(12, 5));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(
            response.choices[0].message.tool_calls.as_ref().unwrap()[0].function.name,
            "lookup"
        );
    }

    #[test]
    fn test_malformed_body_is_protocol_error() {
        let result = OpenAIAdaptor::new().parse_response(ProviderResponse::json("<html>"));
        assert!(matches!(result, Err(AdaptorError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_stream_stops_at_done_and_keeps_usage() {
        let sse = concat!(
            "data: {\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
            "data: {\"id\":\"ignored\",\"choices\":[]}\n\n",
        );
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from(sse))]));
        let chunks: Vec<_> = OpenAIAdaptor::new().parse_stream(body).collect().await;

        assert_eq!(chunks.len(), 3);
        let chunks: Vec<_> = chunks.into_iter().map(Result::unwrap).collect();
        let text: String = chunks.iter().map(|c| c.delta_text()).collect();
        assert_eq!(text, "Hello");
        assert_eq!(chunks[2].usage, Some(Usage::new(3, 2)));
    }
}
