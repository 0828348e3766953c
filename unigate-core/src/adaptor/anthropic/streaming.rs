//! Streaming support for the Messages API
//!
//! Anthropic streams typed events rather than ready-made deltas, so the
//! parser keeps a little state: the message id, the usage reported so far and
//! which content blocks are tool calls.

use super::converter::finish_reason;
use super::types::{BlockDelta, ContentBlock, StreamEvent};
use crate::adaptor::{sse, unix_now, AdaptorError, AdaptorResult, ByteStream, ChatStream};
use crate::protocol::{ChatStreamChunk, MessageDelta, MessageRole, StreamChoice, Usage};
use async_stream::stream;
use futures::Stream;
use serde_json::json;
use std::collections::HashMap;

pub fn parse_stream(body: ByteStream) -> ChatStream {
    Box::pin(chunks(body))
}

#[derive(Default)]
struct StreamState {
    id: String,
    model: String,
    created: i64,
    usage: Usage,
    /// Content block index to tool call index
    tool_indices: HashMap<u32, u32>,
}

impl StreamState {
    fn chunk(
        &self,
        delta: MessageDelta,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> ChatStreamChunk {
        ChatStreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }

    fn text(&self, text: String) -> ChatStreamChunk {
        let delta = MessageDelta {
            content: Some(text),
            ..Default::default()
        };
        self.chunk(delta, None, None)
    }

    fn tool_call(&self, call: serde_json::Value) -> ChatStreamChunk {
        let delta = MessageDelta {
            tool_calls: Some(vec![call]),
            ..Default::default()
        };
        self.chunk(delta, None, None)
    }
}

fn chunks(body: ByteStream) -> impl Stream<Item = AdaptorResult<ChatStreamChunk>> + Send {
    stream! {
        let mut state = StreamState {
            created: unix_now(),
            ..Default::default()
        };

        for await event in sse::events(body) {
            let event = match event.and_then(|e| sse::decode::<StreamEvent>(&e)) {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            match event {
                StreamEvent::MessageStart { message } => {
                    state.id = message.id;
                    state.model = message.model;
                    state.usage = Usage::new(message.usage.input_tokens, message.usage.output_tokens);
                    let delta = MessageDelta {
                        role: Some(MessageRole::Assistant),
                        ..Default::default()
                    };
                    yield Ok(state.chunk(delta, None, Some(state.usage)));
                }
                StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                    ContentBlock::ToolUse { id, name, .. } => {
                        let tool_index =
                            u32::try_from(state.tool_indices.len()).unwrap_or(u32::MAX);
                        state.tool_indices.insert(index, tool_index);
                        yield Ok(state.tool_call(json!({
                            "index": tool_index,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""},
                        })));
                    }
                    ContentBlock::Text { text } if !text.is_empty() => {
                        yield Ok(state.text(text));
                    }
                    _ => {}
                },
                StreamEvent::ContentBlockDelta { index, delta } => match delta {
                    BlockDelta::TextDelta { text } => {
                        yield Ok(state.text(text));
                    }
                    BlockDelta::InputJsonDelta { partial_json } => {
                        if let Some(tool_index) = state.tool_indices.get(&index) {
                            yield Ok(state.tool_call(json!({
                                "index": tool_index,
                                "function": {"arguments": partial_json},
                            })));
                        }
                    }
                    BlockDelta::Other => {}
                },
                StreamEvent::MessageDelta { delta, usage } => {
                    if let Some(usage) = usage {
                        state.usage = state
                            .usage
                            .merge(Usage::new(usage.input_tokens, usage.output_tokens));
                    }
                    let reason = delta.stop_reason.as_deref().map(finish_reason);
                    yield Ok(state.chunk(MessageDelta::default(), reason, Some(state.usage)));
                }
                StreamEvent::MessageStop => return,
                StreamEvent::Error { error } => {
                    yield Err(AdaptorError::Interrupted(format!(
                        "{}: {}",
                        error.error_type, error.message
                    )));
                    return;
                }
                StreamEvent::ContentBlockStop | StreamEvent::Ping | StreamEvent::Unknown => {}
            }
        }
        yield Err(AdaptorError::truncated());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, StreamExt};

    fn body(events: &[&str]) -> ByteStream {
        let text: String = events
            .iter()
            .map(|data| format!("event: x\ndata: {}\n\n", data))
            .collect();
        Box::pin(stream::iter(vec![Ok(Bytes::from(text))]))
    }

    #[tokio::test]
    async fn test_text_stream_with_split_usage() {
        let chunks: Vec<_> = parse_stream(body(&[
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude","usage":{"input_tokens":25,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
            r#"{"type":"message_stop"}"#,
        ]))
        .map(Result::unwrap)
        .collect()
        .await;

        let text: String = chunks.iter().map(|c| c.delta_text()).collect();
        assert_eq!(text, "Hi there");
        assert!(chunks.iter().all(|c| c.id == "msg_1"));

        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.usage, Some(Usage::new(25, 9)));
    }

    #[tokio::test]
    async fn test_tool_use_deltas() {
        let chunks: Vec<_> = parse_stream(body(&[
            r#"{"type":"message_start","message":{"id":"msg_2","model":"claude","usage":{"input_tokens":5}}}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"lookup","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"1}"}}"#,
            r#"{"type":"message_stop"}"#,
        ]))
        .map(Result::unwrap)
        .collect()
        .await;

        let calls: Vec<_> = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.tool_calls.as_ref())
            .map(|calls| calls[0].clone())
            .collect();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0]["id"], "toolu_9");
        assert_eq!(calls[0]["index"], 0);
        assert_eq!(calls[2]["function"]["arguments"], "1}");
    }

    #[tokio::test]
    async fn test_error_event_ends_stream() {
        let items: Vec<_> = parse_stream(body(&[
            r#"{"type":"message_start","message":{"id":"msg_3","usage":{}}}"#,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"late"}}"#,
        ]))
        .collect()
        .await;

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(AdaptorError::Interrupted(m)) if m.contains("overloaded")));
    }

    #[tokio::test]
    async fn test_close_before_message_stop_is_interrupted() {
        let items: Vec<_> = parse_stream(body(&[
            r#"{"type":"message_start","message":{"id":"msg_4","usage":{"input_tokens":3}}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hal"}}"#,
        ]))
        .collect()
        .await;

        assert_eq!(items.len(), 3);
        assert!(items[..2].iter().all(Result::is_ok));
        assert!(matches!(&items[2], Err(AdaptorError::Interrupted(_))));
    }
}
