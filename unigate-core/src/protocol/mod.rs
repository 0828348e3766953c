//! Canonical protocol shared by callers and adaptors
//!
//! Callers speak this model; each adaptor converts it to and from one
//! upstream wire format.

pub mod types;

pub use types::{
    estimate_tokens, ChatRequest, ChatResponse, ChatStreamChunk, ContentPart, FunctionCall,
    FunctionDefinition, ImageUrl, Message, MessageContent, MessageDelta, MessageRole,
    ResponseChoice, StreamChoice, ToolCall, ToolDefinition, Usage,
};
