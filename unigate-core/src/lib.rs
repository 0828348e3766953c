//! Unigate Core Library
//!
//! Request relay engine for a multi-provider LLM gateway: given a canonical
//! chat request and an authenticated token, pick an upstream channel, reserve
//! quota, translate and dispatch the call, fail over on channel-local errors
//! and settle the quota on the observed usage.

pub mod adaptor;
pub mod audit;
pub mod config;
pub mod http;
pub mod model;
pub mod protocol;
pub mod relay;
pub mod store;

pub use adaptor::{Adaptor, AdaptorError, AdaptorRegistry};
pub use audit::{AuditEvent, AuditOutcome, AuditSink};
pub use config::GatewayConfig;
pub use model::{Channel, ChannelDraft, ChannelStatus, ProviderType, Token, TokenStatus};
pub use protocol::{ChatRequest, ChatResponse, ChatStreamChunk, Message, Usage};
pub use relay::{Relay, RelayBuilder, RelayError, RelayErrorKind, RelayOutcome, RelayStream};
pub use store::{ChannelStore, MemoryStore, SqliteStore, TokenStore};

/// Returns the version of the Unigate Core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
