//! Streaming support for `streamGenerateContent?alt=sse`
//!
//! Every event is a complete `GenerateContentResponse` holding the newest
//! slice of text and the usage counted so far.

use super::converter::{read_candidate, to_usage, tool_call};
use super::types::GeminiResponse;
use crate::adaptor::{
    completion_id, sse, unix_now, AdaptorError, AdaptorResult, ByteStream, ChatStream,
};
use crate::protocol::{ChatStreamChunk, MessageDelta, StreamChoice};
use async_stream::stream;
use futures::Stream;
use serde_json::json;

pub fn parse_stream(body: ByteStream) -> ChatStream {
    Box::pin(chunks(body))
}

fn chunks(body: ByteStream) -> impl Stream<Item = AdaptorResult<ChatStreamChunk>> + Send {
    stream! {
        let id = completion_id();
        let created = unix_now();
        let mut tool_index = 0u32;
        let mut finished = false;

        for await event in sse::events(body) {
            let response = match event.and_then(|e| sse::decode::<GeminiResponse>(&e)) {
                Ok(response) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut choices = Vec::with_capacity(response.candidates.len());
            for candidate in response.candidates {
                let output = read_candidate(candidate);
                let tool_calls: Vec<_> = output
                    .calls
                    .into_iter()
                    .map(|call| {
                        let call = tool_call(call);
                        let value = json!({
                            "index": tool_index,
                            "id": call.id,
                            "type": call.tool_type,
                            "function": {
                                "name": call.function.name,
                                "arguments": call.function.arguments,
                            },
                        });
                        tool_index += 1;
                        value
                    })
                    .collect();

                finished |= output.finish_reason.is_some();
                choices.push(StreamChoice {
                    index: output.index,
                    delta: MessageDelta {
                        role: None,
                        content: (!output.text.is_empty()).then_some(output.text),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    },
                    finish_reason: output.finish_reason,
                });
            }

            yield Ok(ChatStreamChunk {
                id: id.clone(),
                object: "chat.completion.chunk".to_string(),
                created,
                model: response.model_version.unwrap_or_default(),
                choices,
                usage: response.usage_metadata.map(to_usage),
            });
        }
        if !finished {
            yield Err(AdaptorError::truncated());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Usage;
    use bytes::Bytes;
    use futures::{stream, StreamExt};

    #[tokio::test]
    async fn test_stream_accumulates_text_and_usage() {
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Bon\"}]}}],\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":1}}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"jour\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":2}}\r\n\r\n",
        );
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from(sse))]));
        let chunks: Vec<_> = parse_stream(body).map(Result::unwrap).collect().await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, chunks[1].id);
        let text: String = chunks.iter().map(|c| c.delta_text()).collect();
        assert_eq!(text, "Bonjour");
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[1].usage, Some(Usage::new(4, 2)));
    }

    #[tokio::test]
    async fn test_function_call_chunk() {
        let sse = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"f\",\"args\":{\"a\":1}}}]},\"finishReason\":\"STOP\"}]}\n\n";
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from(sse))]));
        let chunks: Vec<_> = parse_stream(body).map(Result::unwrap).collect().await;

        let choice = &chunks[0].choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = choice.delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0]["function"]["name"], "f");
        assert_eq!(calls[0]["function"]["arguments"], "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_close_without_finish_reason_is_interrupted() {
        let sse = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Bon\"}]}}]}\n\n";
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from(sse))]));
        let items: Vec<_> = parse_stream(body).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().delta_text(), "Bon");
        assert!(matches!(&items[1], Err(AdaptorError::Interrupted(_))));
    }
}
