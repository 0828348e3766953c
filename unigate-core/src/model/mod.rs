//! Records read and written by the relay engine
//!
//! Channels and tokens are owned by the persistence layer; the engine only
//! mutates channel health and token balances through the store traits.

pub mod ability;
pub mod channel;
pub mod token;

pub use ability::Ability;
pub use channel::{
    normalize_models, Channel, ChannelDraft, ChannelId, ChannelStatus, ProviderType,
};
pub use token::{Token, TokenId, TokenRejection, TokenStatus};
