//! Streaming support for OpenAI responses

use super::converter::from_openai_stream_chunk;
use super::types::OpenAIStreamChunk;
use crate::adaptor::{sse, AdaptorError, ByteStream, ChatStream};
use async_stream::stream;
use tracing::warn;

/// Parse the server-sent events of a chat-completions stream.
///
/// The stream ends at `data: [DONE]`; a body that closes without it ends with
/// an `Interrupted` error. Chunks that fail to decode are logged and skipped.
pub fn parse_stream(body: ByteStream) -> ChatStream {
    Box::pin(stream! {
        for await event in sse::events(body) {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if event.data == "[DONE]" {
                return;
            }
            match serde_json::from_str::<OpenAIStreamChunk>(&event.data) {
                Ok(chunk) => yield Ok(from_openai_stream_chunk(chunk)),
                Err(e) => warn!("Failed to parse stream chunk: {}", e),
            }
        }
        yield Err(AdaptorError::truncated());
    })
}
