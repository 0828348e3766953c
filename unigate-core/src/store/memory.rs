//! In-process store backed by atomics
//!
//! Suitable for a single gateway instance and for tests. Balance mutations are
//! CAS loops on `AtomicI64`, health counters are `AtomicU32`, so no lock is held
//! across a quota decision.

use super::{ChannelStore, StoreError, StoreResult, TokenStore};
use crate::model::{
    normalize_models, Channel, ChannelDraft, ChannelId, ChannelStatus, Token, TokenId, TokenStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

struct ChannelEntry {
    record: RwLock<Channel>,
    status: AtomicU8,
    failures: AtomicU32,
}

impl ChannelEntry {
    fn new(channel: Channel) -> Self {
        Self {
            status: AtomicU8::new(channel.status.code()),
            failures: AtomicU32::new(channel.failure_count),
            record: RwLock::new(channel),
        }
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::from_code(self.status.load(Ordering::Acquire))
            .unwrap_or(ChannelStatus::ManuallyDisabled)
    }

    fn snapshot(&self) -> Channel {
        let mut channel = self.record.read().clone();
        channel.status = self.status();
        channel.failure_count = self.failures.load(Ordering::Acquire);
        channel
    }
}

struct TokenEntry {
    record: Token,
    remain: AtomicI64,
    used: AtomicI64,
    status: AtomicU8,
    accessed_ms: AtomicI64,
}

impl TokenEntry {
    fn new(token: Token) -> Self {
        Self {
            remain: AtomicI64::new(token.remain_quota),
            used: AtomicI64::new(token.used_quota),
            status: AtomicU8::new(token.status.code()),
            accessed_ms: AtomicI64::new(token.accessed_at.timestamp_millis()),
            record: token,
        }
    }

    fn snapshot(&self) -> Token {
        let mut token = self.record.clone();
        token.remain_quota = self.remain.load(Ordering::Acquire);
        token.used_quota = self.used.load(Ordering::Acquire);
        token.status = TokenStatus::from_code(self.status.load(Ordering::Acquire))
            .unwrap_or(TokenStatus::Disabled);
        token.accessed_at = Utc
            .timestamp_millis_opt(self.accessed_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or(token.accessed_at);
        token
    }
}

/// Store keeping every record in process memory
pub struct MemoryStore {
    next_channel_id: AtomicI64,
    next_token_id: AtomicI64,
    channels: DashMap<ChannelId, Arc<ChannelEntry>>,
    abilities: RwLock<HashMap<String, BTreeSet<ChannelId>>>,
    tokens: DashMap<TokenId, Arc<TokenEntry>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_channel_id: AtomicI64::new(1),
            next_token_id: AtomicI64::new(1),
            channels: DashMap::new(),
            abilities: RwLock::new(HashMap::new()),
            tokens: DashMap::new(),
        }
    }

    fn channel(&self, id: ChannelId) -> StoreResult<Arc<ChannelEntry>> {
        self.channels
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::channel_not_found(id))
    }

    fn token(&self, id: TokenId) -> StoreResult<Arc<TokenEntry>> {
        self.tokens
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::token_not_found(id))
    }

    fn index_abilities(&self, id: ChannelId, models: &[String]) {
        let mut abilities = self.abilities.write();
        for channels in abilities.values_mut() {
            channels.remove(&id);
        }
        for model in models {
            abilities.entry(model.clone()).or_default().insert(id);
        }
        abilities.retain(|_, channels| !channels.is_empty());
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn channels_for_capability(&self, capability: &str) -> StoreResult<Vec<Channel>> {
        let ids: Vec<ChannelId> = self
            .abilities
            .read()
            .get(capability)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        Ok(ids
            .into_iter()
            .filter_map(|id| self.channels.get(&id).map(|entry| entry.snapshot()))
            .filter(Channel::is_eligible)
            .collect())
    }

    async fn get_channel(&self, id: ChannelId) -> StoreResult<Option<Channel>> {
        Ok(self.channels.get(&id).map(|entry| entry.snapshot()))
    }

    async fn insert_channels(&self, drafts: Vec<ChannelDraft>) -> StoreResult<Vec<ChannelId>> {
        let now = Utc::now();
        let mut ids = Vec::new();
        for draft in drafts.iter().flat_map(ChannelDraft::split_keys) {
            let id = self.next_channel_id.fetch_add(1, Ordering::AcqRel);
            let channel = draft.into_channel(id, now);
            self.index_abilities(id, &channel.models);
            self.channels.insert(id, Arc::new(ChannelEntry::new(channel)));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn rebuild_abilities(&self, id: ChannelId, models: Vec<String>) -> StoreResult<()> {
        let entry = self.channel(id)?;
        let models = normalize_models(&models);
        entry.record.write().models = models.clone();
        self.index_abilities(id, &models);
        Ok(())
    }

    async fn set_status(&self, id: ChannelId, status: ChannelStatus) -> StoreResult<()> {
        let entry = self.channel(id)?;
        entry.status.store(status.code(), Ordering::Release);
        if status == ChannelStatus::Enabled {
            entry.failures.store(0, Ordering::Release);
        }
        Ok(())
    }

    async fn delete_disabled(&self) -> StoreResult<usize> {
        let disabled: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|entry| entry.status().is_disabled())
            .map(|entry| *entry.key())
            .collect();

        for id in &disabled {
            self.channels.remove(id);
            self.index_abilities(*id, &[]);
        }
        Ok(disabled.len())
    }

    async fn record_failure(&self, id: ChannelId) -> StoreResult<u32> {
        let entry = self.channel(id)?;
        Ok(entry.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1))
    }

    async fn reset_failures(&self, id: ChannelId) -> StoreResult<()> {
        self.channel(id)?.failures.store(0, Ordering::Release);
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: ChannelId,
        expected: ChannelStatus,
        new: ChannelStatus,
    ) -> StoreResult<bool> {
        let entry = self.channel(id)?;
        Ok(entry
            .status
            .compare_exchange(
                expected.code(),
                new.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, mut token: Token) -> StoreResult<TokenId> {
        let id = self.next_token_id.fetch_add(1, Ordering::AcqRel);
        token.id = id;
        self.tokens.insert(id, Arc::new(TokenEntry::new(token)));
        Ok(id)
    }

    async fn get_token(&self, id: TokenId) -> StoreResult<Option<Token>> {
        Ok(self.tokens.get(&id).map(|entry| entry.snapshot()))
    }

    async fn try_debit(&self, id: TokenId, amount: i64) -> StoreResult<bool> {
        let entry = self.token(id)?;
        let unlimited = entry.record.unlimited_quota;
        let debited = entry
            .remain
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remain| {
                (unlimited || remain >= amount).then(|| remain - amount)
            })
            .is_ok();
        if debited {
            entry.used.fetch_add(amount, Ordering::AcqRel);
        }
        Ok(debited)
    }

    async fn debit_up_to(&self, id: TokenId, amount: i64) -> StoreResult<i64> {
        let entry = self.token(id)?;
        let unlimited = entry.record.unlimited_quota;
        let mut charged = 0;
        // The closure always returns Some, so the update cannot fail.
        let _ = entry
            .remain
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remain| {
                charged = if unlimited {
                    amount
                } else {
                    amount.min(remain.max(0))
                };
                Some(remain - charged)
            });
        entry.used.fetch_add(charged, Ordering::AcqRel);
        Ok(charged)
    }

    async fn credit(&self, id: TokenId, amount: i64) -> StoreResult<()> {
        let entry = self.token(id)?;
        let remain = entry.remain.fetch_add(amount, Ordering::AcqRel) + amount;
        entry.used.fetch_sub(amount, Ordering::AcqRel);
        if remain > 0 {
            let _ = entry.status.compare_exchange(
                TokenStatus::Exhausted.code(),
                TokenStatus::Enabled.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        Ok(())
    }

    async fn touch(&self, id: TokenId, at: DateTime<Utc>) -> StoreResult<()> {
        self.token(id)?
            .accessed_ms
            .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
        Ok(())
    }

    async fn mark_exhausted_if_empty(&self, id: TokenId) -> StoreResult<bool> {
        let entry = self.token(id)?;
        if entry.record.unlimited_quota || entry.remain.load(Ordering::Acquire) > 0 {
            return Ok(false);
        }
        let marked = entry
            .status
            .compare_exchange(
                TokenStatus::Enabled.code(),
                TokenStatus::Exhausted.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        // A concurrent credit may have landed between the load and the swap.
        if marked && entry.remain.load(Ordering::Acquire) > 0 {
            let _ = entry.status.compare_exchange(
                TokenStatus::Exhausted.code(),
                TokenStatus::Enabled.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return Ok(false);
        }
        Ok(marked)
    }
}
