//! Conversion between the canonical protocol and `generateContent`

use super::types::*;
use crate::adaptor::{
    completion_id, parse_data_uri, parse_tool_arguments, unix_now, AdaptorError, AdaptorResult,
};
use crate::model::ProviderType;
use crate::protocol::{
    ChatRequest, ChatResponse, ContentPart, FunctionCall, Message, MessageContent, MessageRole,
    ResponseChoice, ToolCall, ToolDefinition, Usage,
};
use serde_json::{json, Value};
use std::collections::HashMap;

pub fn to_gemini_request(request: &ChatRequest) -> AdaptorResult<GeminiRequest> {
    if request.n.is_some_and(|n| n > 1) {
        return Err(AdaptorError::unsupported(
            ProviderType::Gemini,
            "multiple completions (n > 1)",
        ));
    }

    let (system_instruction, contents) = convert_messages(&request.messages)?;

    let generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop.clone(),
    };
    let has_generation_config = generation_config.temperature.is_some()
        || generation_config.top_p.is_some()
        || generation_config.max_output_tokens.is_some()
        || generation_config.stop_sequences.is_some();

    Ok(GeminiRequest {
        contents,
        system_instruction,
        generation_config: has_generation_config.then_some(generation_config),
        tools: request.tools.as_deref().map(convert_tools),
        tool_config: request
            .tool_choice
            .as_ref()
            .map(convert_tool_choice)
            .transpose()?,
    })
}

fn convert_messages(messages: &[Message]) -> AdaptorResult<(Option<GeminiContent>, Vec<GeminiContent>)> {
    // functionResponse parts are keyed by function name, tool messages by call id
    let call_names: HashMap<&str, &str> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|call| (call.id.as_str(), call.function.name.as_str()))
        .collect();

    let mut system_parts = Vec::new();
    let mut contents: Vec<GeminiContent> = Vec::new();

    for message in messages {
        let (role, parts) = match message.role {
            MessageRole::System => {
                let text = message.content.joined_text();
                if !text.is_empty() {
                    system_parts.push(GeminiPart::text(text));
                }
                continue;
            }
            MessageRole::User => ("user", content_parts(&message.content)?),
            MessageRole::Assistant => {
                let mut parts = content_parts(&message.content)?;
                for call in message.tool_calls.iter().flatten() {
                    parts.push(GeminiPart {
                        function_call: Some(GeminiFunctionCall {
                            name: call.function.name.clone(),
                            args: parse_tool_arguments(&call.function.arguments)?,
                        }),
                        ..Default::default()
                    });
                }
                ("model", parts)
            }
            MessageRole::Tool => {
                let call_id = message.tool_call_id.as_deref().ok_or_else(|| {
                    AdaptorError::invalid_request("tool message without tool_call_id")
                })?;
                let name = call_names.get(call_id).ok_or_else(|| {
                    AdaptorError::invalid_request(format!(
                        "tool result '{}' does not answer any earlier tool call",
                        call_id
                    ))
                })?;
                let part = GeminiPart {
                    function_response: Some(GeminiFunctionResponse {
                        name: name.to_string(),
                        response: tool_response(&message.content.joined_text()),
                    }),
                    ..Default::default()
                };
                ("user", vec![part])
            }
        };

        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(GeminiContent {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let system = (!system_parts.is_empty()).then(|| GeminiContent {
        role: None,
        parts: system_parts,
    });
    Ok((system, contents))
}

/// `functionResponse.response` must be an object
fn tool_response(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "content": text }),
    }
}

fn content_parts(content: &MessageContent) -> AdaptorResult<Vec<GeminiPart>> {
    match content {
        MessageContent::Text(text) if text.is_empty() => Ok(Vec::new()),
        MessageContent::Text(text) => Ok(vec![GeminiPart::text(text.clone())]),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter(|part| !matches!(part, ContentPart::Text { text } if text.is_empty()))
            .map(|part| match part {
                ContentPart::Text { text } => Ok(GeminiPart::text(text.clone())),
                ContentPart::ImageUrl { image_url } => {
                    let (mime_type, data) = parse_data_uri(&image_url.url).ok_or_else(|| {
                        AdaptorError::unsupported(
                            ProviderType::Gemini,
                            "image URLs (only base64 data URIs are accepted)",
                        )
                    })?;
                    Ok(GeminiPart {
                        inline_data: Some(InlineData {
                            mime_type: mime_type.to_string(),
                            data: data.to_string(),
                        }),
                        ..Default::default()
                    })
                }
            })
            .collect(),
    }
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<GeminiTool> {
    vec![GeminiTool {
        function_declarations: tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: tool.function.parameters.clone(),
            })
            .collect(),
    }]
}

fn convert_tool_choice(choice: &Value) -> AdaptorResult<Value> {
    let config = match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => json!({"mode": "AUTO"}),
            "required" => json!({"mode": "ANY"}),
            "none" => json!({"mode": "NONE"}),
            other => {
                return Err(AdaptorError::invalid_request(format!(
                    "unknown tool_choice '{}'",
                    other
                )))
            }
        },
        Value::Object(_) => {
            let name = choice
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| AdaptorError::invalid_request("tool_choice object without function name"))?;
            json!({"mode": "ANY", "allowedFunctionNames": [name]})
        }
        _ => return Err(AdaptorError::invalid_request("tool_choice must be a string or object")),
    };
    Ok(json!({ "functionCallingConfig": config }))
}

/// Map a Gemini finish reason onto the chat-completions vocabulary
pub fn finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => "content_filter",
        _ => "stop",
    }
    .to_string()
}

pub fn to_usage(metadata: UsageMetadata) -> Usage {
    Usage::new(metadata.prompt_token_count, metadata.candidates_token_count)
}

/// What one candidate contributed: its text, function calls and finish reason
pub struct CandidateOutput {
    pub index: u32,
    pub text: String,
    pub calls: Vec<GeminiFunctionCall>,
    pub finish_reason: Option<String>,
}

pub fn read_candidate(candidate: Candidate) -> CandidateOutput {
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in candidate.content.parts {
        if part.thought {
            continue;
        }
        if let Some(part_text) = part.text {
            text.push_str(&part_text);
        }
        if let Some(call) = part.function_call {
            calls.push(call);
        }
    }

    let finish_reason = candidate.finish_reason.as_deref().map(|reason| {
        if !calls.is_empty() && reason == "STOP" {
            "tool_calls".to_string()
        } else {
            finish_reason(reason)
        }
    });

    CandidateOutput {
        index: candidate.index,
        text,
        calls,
        finish_reason,
    }
}

pub fn tool_call(call: GeminiFunctionCall) -> ToolCall {
    ToolCall {
        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        tool_type: "function".to_string(),
        function: FunctionCall {
            name: call.name,
            arguments: call.args.to_string(),
        },
    }
}

pub fn from_gemini_response(response: GeminiResponse) -> AdaptorResult<(ChatResponse, Usage)> {
    let usage = response.usage_metadata.map(to_usage).unwrap_or_default();

    let choices: Vec<ResponseChoice> = if response.candidates.is_empty() {
        let reason = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .ok_or_else(|| AdaptorError::Protocol("response without candidates".to_string()))?;
        tracing::debug!("Gemini blocked the prompt: {}", reason);
        vec![ResponseChoice {
            index: 0,
            message: Message::assistant(""),
            finish_reason: Some("content_filter".to_string()),
        }]
    } else {
        response
            .candidates
            .into_iter()
            .map(|candidate| {
                let output = read_candidate(candidate);
                let mut message = Message::assistant(output.text);
                if !output.calls.is_empty() {
                    message.tool_calls = Some(output.calls.into_iter().map(tool_call).collect());
                }
                ResponseChoice {
                    index: output.index,
                    message,
                    finish_reason: output.finish_reason,
                }
            })
            .collect()
    };

    let chat = ChatResponse {
        id: response.response_id.unwrap_or_else(completion_id),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: response.model_version.unwrap_or_default(),
        choices,
        usage: Some(usage),
    };
    Ok((chat, usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ImageUrl;

    #[test]
    fn test_roles_and_system_instruction() {
        let request = ChatRequest::new(
            "gemini-1.5-flash",
            vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("again"),
            ],
        )
        .with_max_tokens(50);
        let converted = to_gemini_request(&request).unwrap();

        let system = converted.system_instruction.unwrap();
        assert_eq!(system.role, None);
        assert_eq!(system.parts[0].text.as_deref(), Some("be brief"));
        let roles: Vec<_> = converted
            .contents
            .iter()
            .map(|c| c.role.as_deref().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(converted.generation_config.unwrap().max_output_tokens, Some(50));
    }

    #[test]
    fn test_tool_result_uses_function_name() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_7".to_string(),
            tool_type: "function".to_string(),
            function: FunctionCall {
                name: "weather".to_string(),
                arguments: "{\"city\":\"Lima\"}".to_string(),
            },
        }]);
        let request = ChatRequest::new(
            "gemini",
            vec![
                Message::user("weather?"),
                assistant,
                Message::tool("call_7", "{\"temp\":18}"),
            ],
        );
        let converted = to_gemini_request(&request).unwrap();

        let call = converted.contents[1].parts[0].function_call.as_ref().unwrap();
        assert_eq!(call.args["city"], "Lima");
        let response = converted.contents[2].parts[0]
            .function_response
            .as_ref()
            .unwrap();
        assert_eq!(response.name, "weather");
        assert_eq!(response.response["temp"], 18);
    }

    #[test]
    fn test_orphan_tool_result_rejected() {
        let request = ChatRequest::new("gemini", vec![Message::tool("call_x", "data")]);
        assert!(matches!(
            to_gemini_request(&request),
            Err(AdaptorError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_remote_image_unsupported() {
        let msg = Message {
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/a.png".to_string(),
                    detail: None,
                },
            }]),
            ..Message::user("")
        };
        let request = ChatRequest::new("gemini", vec![msg]);
        assert!(matches!(
            to_gemini_request(&request),
            Err(AdaptorError::UnsupportedCapability { provider: ProviderType::Gemini, .. })
        ));
    }

    #[test]
    fn test_blocked_prompt() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"promptFeedback":{"blockReason":"SAFETY"},"usageMetadata":{"promptTokenCount":8}}"#,
        )
        .unwrap();
        let (chat, usage) = from_gemini_response(response).unwrap();
        assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("content_filter"));
        assert_eq!(usage, Usage::new(8, 0));
    }

    #[test]
    fn test_empty_response_is_protocol_error() {
        assert!(matches!(
            from_gemini_response(GeminiResponse::default()),
            Err(AdaptorError::Protocol(_))
        ));
    }
}
