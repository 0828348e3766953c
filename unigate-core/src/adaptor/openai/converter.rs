//! Conversion between the canonical protocol and OpenAI format

use super::types::*;
use crate::adaptor::{completion_id, unix_now};
use crate::protocol::{
    ChatRequest, ChatResponse, ChatStreamChunk, ResponseChoice, StreamChoice, Usage,
};

/// Convert a canonical request, sending `upstream_model` as the model name
pub fn to_openai_request<'a>(request: &'a ChatRequest, upstream_model: &'a str) -> OpenAIRequest<'a> {
    OpenAIRequest {
        model: upstream_model,
        messages: &request.messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        n: request.n,
        stop: request.stop.as_deref(),
        stream: request.stream,
        stream_options: request
            .stream
            .then_some(OpenAIStreamOptions { include_usage: true }),
        tools: request.tools.as_deref(),
        tool_choice: request.tool_choice.as_ref(),
        user: request.user.as_deref(),
    }
}

fn to_usage(usage: OpenAIUsage) -> Usage {
    Usage::new(usage.prompt_tokens, usage.completion_tokens)
}

pub fn from_openai_response(response: OpenAIResponse) -> (ChatResponse, Usage) {
    let usage = response.usage.map(to_usage).unwrap_or_default();
    let id = if response.id.is_empty() {
        completion_id()
    } else {
        response.id
    };
    let created = if response.created == 0 {
        unix_now()
    } else {
        response.created
    };

    let chat = ChatResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model: response.model,
        choices: response
            .choices
            .into_iter()
            .map(|choice| ResponseChoice {
                index: choice.index,
                message: choice.message,
                finish_reason: choice.finish_reason,
            })
            .collect(),
        usage: response.usage.map(to_usage),
    };
    (chat, usage)
}

pub fn from_openai_stream_chunk(chunk: OpenAIStreamChunk) -> ChatStreamChunk {
    ChatStreamChunk {
        id: chunk.id,
        object: "chat.completion.chunk".to_string(),
        created: chunk.created,
        model: chunk.model,
        choices: chunk
            .choices
            .into_iter()
            .map(|choice| StreamChoice {
                index: choice.index,
                delta: choice.delta,
                finish_reason: choice.finish_reason,
            })
            .collect(),
        usage: chunk.usage.map(to_usage),
    }
}
