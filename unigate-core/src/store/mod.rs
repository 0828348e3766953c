//! Persistence seams for channels and token balances
//!
//! Every mutation the relay engine performs on shared state goes through these
//! traits and must be atomic at the storage level: several gateway instances may
//! share one store, so a process-local lock is never enough.

mod error;
mod memory;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{Channel, ChannelDraft, ChannelId, ChannelStatus, Token, TokenId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Channel registry, abilities and channel health
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Enabled channels holding an ability for `capability`
    async fn channels_for_capability(&self, capability: &str) -> StoreResult<Vec<Channel>>;

    async fn get_channel(&self, id: ChannelId) -> StoreResult<Option<Channel>>;

    /// Insert one channel per non-blank key line of every draft, abilities included
    async fn insert_channels(&self, drafts: Vec<ChannelDraft>) -> StoreResult<Vec<ChannelId>>;

    /// Replace a channel's model list and its abilities
    async fn rebuild_abilities(&self, id: ChannelId, models: Vec<String>) -> StoreResult<()>;

    /// Operator status change; resets the failure counter when enabling
    async fn set_status(&self, id: ChannelId, status: ChannelStatus) -> StoreResult<()>;

    /// Remove every manually or automatically disabled channel
    async fn delete_disabled(&self) -> StoreResult<usize>;

    /// Atomically increment the failure counter, returning the new value
    async fn record_failure(&self, id: ChannelId) -> StoreResult<u32>;

    async fn reset_failures(&self, id: ChannelId) -> StoreResult<()>;

    /// Transition `expected -> new` only if the stored status still equals `expected`
    async fn compare_and_set_status(
        &self,
        id: ChannelId,
        expected: ChannelStatus,
        new: ChannelStatus,
    ) -> StoreResult<bool>;
}

/// Token records and quota balances
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: Token) -> StoreResult<TokenId>;

    async fn get_token(&self, id: TokenId) -> StoreResult<Option<Token>>;

    /// Debit `amount` only if the balance covers it or the token is unlimited.
    ///
    /// Returns `false` with the balance untouched otherwise.
    async fn try_debit(&self, id: TokenId, amount: i64) -> StoreResult<bool>;

    /// Debit up to `amount`, never taking a limited balance below zero.
    ///
    /// Returns the amount actually debited.
    async fn debit_up_to(&self, id: TokenId, amount: i64) -> StoreResult<i64>;

    /// Return `amount` to the balance
    async fn credit(&self, id: TokenId, amount: i64) -> StoreResult<()>;

    async fn touch(&self, id: TokenId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Mark a limited, enabled token with no balance left as exhausted
    async fn mark_exhausted_if_empty(&self, id: TokenId) -> StoreResult<bool>;
}
