//! Conversion between the canonical protocol and the Messages API
//!
//! System messages are hoisted into the top-level `system` field, tool
//! results travel as user turns, and consecutive turns of the same role are
//! merged because the API requires strict user/assistant alternation.

use super::types::*;
use crate::adaptor::{parse_data_uri, parse_tool_arguments, unix_now, AdaptorError, AdaptorResult};
use crate::model::ProviderType;
use crate::protocol::{
    ChatRequest, ChatResponse, ContentPart, FunctionCall, Message, MessageContent, MessageRole,
    ResponseChoice, ToolCall, ToolDefinition, Usage,
};
use serde_json::{json, Value};

/// Used when the caller leaves `max_tokens` unset
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub fn to_anthropic_request(
    request: &ChatRequest,
    upstream_model: &str,
) -> AdaptorResult<AnthropicRequest> {
    if request.n.is_some_and(|n| n > 1) {
        return Err(AdaptorError::unsupported(
            ProviderType::Anthropic,
            "multiple completions (n > 1)",
        ));
    }

    let (system, messages) = convert_messages(&request.messages)?;

    Ok(AnthropicRequest {
        model: upstream_model.to_string(),
        messages,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system,
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop.clone(),
        stream: request.stream,
        tools: request.tools.as_deref().map(convert_tools),
        tool_choice: request
            .tool_choice
            .as_ref()
            .map(convert_tool_choice)
            .transpose()?,
        metadata: request.user.as_ref().map(|user| AnthropicMetadata {
            user_id: user.clone(),
        }),
    })
}

fn convert_messages(messages: &[Message]) -> AdaptorResult<(Option<String>, Vec<AnthropicMessage>)> {
    let mut system = Vec::new();
    let mut converted: Vec<AnthropicMessage> = Vec::new();

    for message in messages {
        let (role, blocks) = match message.role {
            MessageRole::System => {
                let text = message.content.joined_text();
                if !text.is_empty() {
                    system.push(text);
                }
                continue;
            }
            MessageRole::User => ("user", content_blocks(&message.content)?),
            MessageRole::Assistant => {
                let mut blocks = content_blocks(&message.content)?;
                for call in message.tool_calls.iter().flatten() {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: parse_tool_arguments(&call.function.arguments)?,
                    });
                }
                ("assistant", blocks)
            }
            MessageRole::Tool => {
                let tool_use_id = message.tool_call_id.clone().ok_or_else(|| {
                    AdaptorError::invalid_request("tool message without tool_call_id")
                })?;
                let result = ContentBlock::ToolResult {
                    tool_use_id,
                    content: message.content.joined_text(),
                };
                ("user", vec![result])
            }
        };

        if blocks.is_empty() {
            continue;
        }
        match converted.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => converted.push(AnthropicMessage {
                role: role.to_string(),
                content: blocks,
            }),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((system, converted))
}

fn content_blocks(content: &MessageContent) -> AdaptorResult<Vec<ContentBlock>> {
    match content {
        MessageContent::Text(text) if text.is_empty() => Ok(Vec::new()),
        MessageContent::Text(text) => Ok(vec![ContentBlock::Text { text: text.clone() }]),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter(|part| !matches!(part, ContentPart::Text { text } if text.is_empty()))
            .map(|part| match part {
                ContentPart::Text { text } => Ok(ContentBlock::Text { text: text.clone() }),
                ContentPart::ImageUrl { image_url } => Ok(ContentBlock::Image {
                    source: image_source(&image_url.url)?,
                }),
            })
            .collect(),
    }
}

fn image_source(url: &str) -> AdaptorResult<ImageSource> {
    if let Some((media_type, data)) = parse_data_uri(url) {
        return Ok(ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        });
    }
    if url.starts_with("https://") || url.starts_with("http://") {
        return Ok(ImageSource::Url {
            url: url.to_string(),
        });
    }
    Err(AdaptorError::invalid_request(
        "image_url must be an http(s) URL or a base64 data URI",
    ))
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| AnthropicTool {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect()
}

fn convert_tool_choice(choice: &Value) -> AdaptorResult<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Ok(json!({"type": "auto"})),
            "required" => Ok(json!({"type": "any"})),
            "none" => Ok(json!({"type": "none"})),
            other => Err(AdaptorError::invalid_request(format!(
                "unknown tool_choice '{}'",
                other
            ))),
        },
        Value::Object(_) => choice
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|name| json!({"type": "tool", "name": name}))
            .ok_or_else(|| AdaptorError::invalid_request("tool_choice object without function name")),
        _ => Err(AdaptorError::invalid_request("tool_choice must be a string or object")),
    }
}

/// Map a Messages API stop reason onto the chat-completions vocabulary
pub fn finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        other => other,
    }
    .to_string()
}

pub fn from_anthropic_response(response: AnthropicResponse) -> (ChatResponse, Usage) {
    let usage = Usage::new(response.usage.input_tokens, response.usage.output_tokens);

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text: part } => text.push_str(&part),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                tool_type: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    let mut message = Message::assistant(text);
    if !tool_calls.is_empty() {
        message.tool_calls = Some(tool_calls);
    }

    let chat = ChatResponse {
        id: response.id,
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: response.model,
        choices: vec![ResponseChoice {
            index: 0,
            message,
            finish_reason: response.stop_reason.as_deref().map(finish_reason),
        }],
        usage: Some(usage),
    };
    (chat, usage)
}
