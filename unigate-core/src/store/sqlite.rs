//! SQLite-backed store
//!
//! Quota and health mutations are single conditional statements, so several
//! gateway processes sharing one database file never overdraw a token or
//! double-disable a channel.

use super::{ChannelStore, StoreError, StoreResult, TokenStore};
use crate::config::SecretString;
use crate::model::{
    normalize_models, Channel, ChannelDraft, ChannelId, ChannelStatus, Token, TokenId, TokenStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT    NOT NULL,
    provider_type   TEXT    NOT NULL,
    key             TEXT    NOT NULL,
    base_url        TEXT,
    models          TEXT    NOT NULL DEFAULT '',
    model_mapping   TEXT    NOT NULL DEFAULT '{}',
    status          INTEGER NOT NULL DEFAULT 1,
    priority        INTEGER NOT NULL DEFAULT 0,
    weight          INTEGER NOT NULL DEFAULT 1,
    failure_count   INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS abilities (
    model       TEXT    NOT NULL,
    channel_id  INTEGER NOT NULL,
    PRIMARY KEY (model, channel_id)
);

CREATE INDEX IF NOT EXISTS idx_abilities_channel ON abilities(channel_id);

CREATE TABLE IF NOT EXISTS tokens (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         INTEGER NOT NULL,
    name            TEXT    NOT NULL,
    key             TEXT    NOT NULL UNIQUE,
    status          INTEGER NOT NULL DEFAULT 1,
    remain_quota    INTEGER NOT NULL DEFAULT 0,
    used_quota      INTEGER NOT NULL DEFAULT 0,
    unlimited_quota INTEGER NOT NULL DEFAULT 0,
    expires_at      INTEGER,
    accessed_at     INTEGER NOT NULL
);
"#;

const CHANNEL_COLUMNS: &str = "c.id, c.name, c.provider_type, c.key, c.base_url, c.models, \
     c.model_mapping, c.status, c.priority, c.weight, c.failure_count, c.created_at";

const TOKEN_COLUMNS: &str = "id, user_id, name, key, status, remain_quota, used_quota, \
     unlimited_quota, expires_at, accessed_at";

/// Store persisting channels, abilities and tokens in SQLite
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Background(format!("create {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Opened {:?} with journal_mode={}", path, mode);
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking SQLite work off the async executor
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
    }
}

struct ChannelRow {
    id: ChannelId,
    name: String,
    provider_type: String,
    key: String,
    base_url: Option<String>,
    models: String,
    model_mapping: String,
    status: u8,
    priority: i64,
    weight: u32,
    failure_count: u32,
    created_at: i64,
}

impl ChannelRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            provider_type: row.get(2)?,
            key: row.get(3)?,
            base_url: row.get(4)?,
            models: row.get(5)?,
            model_mapping: row.get(6)?,
            status: row.get(7)?,
            priority: row.get(8)?,
            weight: row.get(9)?,
            failure_count: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_channel(self) -> StoreResult<Channel> {
        let provider_type = self.provider_type.parse().map_err(StoreError::Corrupt)?;
        let status = ChannelStatus::from_code(self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("channel {} has status {}", self.id, self.status))
        })?;
        let model_mapping: HashMap<String, String> = if self.model_mapping.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&self.model_mapping).map_err(|e| {
                StoreError::Corrupt(format!("channel {} model_mapping: {}", self.id, e))
            })?
        };
        let models: Vec<&str> = self.models.split(',').collect();

        Ok(Channel {
            id: self.id,
            name: self.name,
            provider_type,
            key: SecretString::new(self.key),
            base_url: self.base_url,
            models: normalize_models(&models),
            model_mapping,
            status,
            priority: self.priority,
            weight: self.weight,
            failure_count: self.failure_count,
            created_at: from_unix_millis(self.created_at),
        })
    }
}

struct TokenRow {
    id: TokenId,
    user_id: i64,
    name: String,
    key: String,
    status: u8,
    remain_quota: i64,
    used_quota: i64,
    unlimited_quota: bool,
    expires_at: Option<i64>,
    accessed_at: i64,
}

impl TokenRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            key: row.get(3)?,
            status: row.get(4)?,
            remain_quota: row.get(5)?,
            used_quota: row.get(6)?,
            unlimited_quota: row.get(7)?,
            expires_at: row.get(8)?,
            accessed_at: row.get(9)?,
        })
    }

    fn into_token(self) -> StoreResult<Token> {
        let status = TokenStatus::from_code(self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("token {} has status {}", self.id, self.status))
        })?;
        Ok(Token {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            key: SecretString::new(self.key),
            status,
            remain_quota: self.remain_quota,
            used_quota: self.used_quota,
            unlimited_quota: self.unlimited_quota,
            expires_at: self.expires_at.map(from_unix_millis),
            accessed_at: from_unix_millis(self.accessed_at),
        })
    }
}

fn from_unix_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn insert_abilities(conn: &Connection, id: ChannelId, models: &[String]) -> StoreResult<()> {
    let mut stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO abilities (model, channel_id) VALUES (?1, ?2)")?;
    for model in models {
        stmt.execute(params![model, id])?;
    }
    Ok(())
}

fn token_exists(conn: &Connection, id: TokenId) -> StoreResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM tokens WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn require_changed(changed: usize, not_found: impl FnOnce() -> StoreError) -> StoreResult<()> {
    if changed == 0 {
        Err(not_found())
    } else {
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for SqliteStore {
    async fn channels_for_capability(&self, capability: &str) -> StoreResult<Vec<Channel>> {
        let capability = capability.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels c \
                 JOIN abilities a ON a.channel_id = c.id \
                 WHERE a.model = ?1 AND c.status = ?2 AND TRIM(c.key) <> '' \
                 ORDER BY c.id"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(
                    params![capability, ChannelStatus::Enabled.code()],
                    ChannelRow::read,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ChannelRow::into_channel).collect()
        })
        .await
    }

    async fn get_channel(&self, id: ChannelId) -> StoreResult<Option<Channel>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1");
            conn.query_row(&sql, params![id], ChannelRow::read)
                .optional()?
                .map(ChannelRow::into_channel)
                .transpose()
        })
        .await
    }

    async fn insert_channels(&self, drafts: Vec<ChannelDraft>) -> StoreResult<Vec<ChannelId>> {
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp_millis();
            let tx = conn.transaction()?;
            let mut ids = Vec::new();
            for draft in drafts.iter().flat_map(ChannelDraft::split_keys) {
                let models = draft.normalized_models();
                let mapping = serde_json::to_string(&draft.model_mapping)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                tx.execute(
                    "INSERT INTO channels (name, provider_type, key, base_url, models, \
                     model_mapping, status, priority, weight, failure_count, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
                    params![
                        draft.name,
                        draft.provider_type.as_str(),
                        draft.key.expose_secret(),
                        draft.base_url,
                        models.join(","),
                        mapping,
                        draft.status.code(),
                        draft.priority,
                        draft.weight,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                insert_abilities(&tx, id, &models)?;
                ids.push(id);
            }
            tx.commit()?;
            debug!("Inserted {} channel(s)", ids.len());
            Ok(ids)
        })
        .await
    }

    async fn rebuild_abilities(&self, id: ChannelId, models: Vec<String>) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let models = normalize_models(&models);
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE channels SET models = ?1 WHERE id = ?2",
                params![models.join(","), id],
            )?;
            require_changed(changed, || StoreError::channel_not_found(id))?;
            tx.execute("DELETE FROM abilities WHERE channel_id = ?1", params![id])?;
            insert_abilities(&tx, id, &models)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_status(&self, id: ChannelId, status: ChannelStatus) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE channels SET status = ?1, \
                 failure_count = CASE WHEN ?1 = ?2 THEN 0 ELSE failure_count END \
                 WHERE id = ?3",
                params![status.code(), ChannelStatus::Enabled.code(), id],
            )?;
            require_changed(changed, || StoreError::channel_not_found(id))
        })
        .await
    }

    async fn delete_disabled(&self) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            let enabled = ChannelStatus::Enabled.code();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM abilities WHERE channel_id IN \
                 (SELECT id FROM channels WHERE status <> ?1)",
                params![enabled],
            )?;
            let removed = tx.execute("DELETE FROM channels WHERE status <> ?1", params![enabled])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn record_failure(&self, id: ChannelId) -> StoreResult<u32> {
        self.with_conn(move |conn| {
            conn.query_row(
                "UPDATE channels SET failure_count = failure_count + 1 \
                 WHERE id = ?1 RETURNING failure_count",
                params![id],
                |row| row.get::<_, u32>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::channel_not_found(id))
        })
        .await
    }

    async fn reset_failures(&self, id: ChannelId) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE channels SET failure_count = 0 WHERE id = ?1",
                params![id],
            )?;
            require_changed(changed, || StoreError::channel_not_found(id))
        })
        .await
    }

    async fn compare_and_set_status(
        &self,
        id: ChannelId,
        expected: ChannelStatus,
        new: ChannelStatus,
    ) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE channels SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![new.code(), id, expected.code()],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn insert_token(&self, token: Token) -> StoreResult<TokenId> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tokens (user_id, name, key, status, remain_quota, used_quota, \
                 unlimited_quota, expires_at, accessed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    token.user_id,
                    token.name,
                    token.key.expose_secret(),
                    token.status.code(),
                    token.remain_quota,
                    token.used_quota,
                    token.unlimited_quota,
                    token.expires_at.map(|at| at.timestamp_millis()),
                    token.accessed_at.timestamp_millis(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_token(&self, id: TokenId) -> StoreResult<Option<Token>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1");
            conn.query_row(&sql, params![id], TokenRow::read)
                .optional()?
                .map(TokenRow::into_token)
                .transpose()
        })
        .await
    }

    async fn try_debit(&self, id: TokenId, amount: i64) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens SET remain_quota = remain_quota - ?1, \
                 used_quota = used_quota + ?1 \
                 WHERE id = ?2 AND (unlimited_quota = 1 OR remain_quota >= ?1)",
                params![amount, id],
            )?;
            if changed == 1 {
                return Ok(true);
            }
            if token_exists(conn, id)? {
                Ok(false)
            } else {
                Err(StoreError::token_not_found(id))
            }
        })
        .await
    }

    async fn debit_up_to(&self, id: TokenId, amount: i64) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (remain, unlimited): (i64, bool) = tx
                .query_row(
                    "SELECT remain_quota, unlimited_quota FROM tokens WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| StoreError::token_not_found(id))?;

            let charged = if unlimited {
                amount
            } else {
                amount.min(remain.max(0))
            };
            tx.execute(
                "UPDATE tokens SET remain_quota = remain_quota - ?1, \
                 used_quota = used_quota + ?1 WHERE id = ?2",
                params![charged, id],
            )?;
            tx.commit()?;
            Ok(charged)
        })
        .await
    }

    async fn credit(&self, id: TokenId, amount: i64) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens SET remain_quota = remain_quota + ?1, \
                 used_quota = used_quota - ?1, \
                 status = CASE WHEN status = ?3 AND remain_quota + ?1 > 0 THEN ?4 ELSE status END \
                 WHERE id = ?2",
                params![
                    amount,
                    id,
                    TokenStatus::Exhausted.code(),
                    TokenStatus::Enabled.code()
                ],
            )?;
            require_changed(changed, || StoreError::token_not_found(id))
        })
        .await
    }

    async fn touch(&self, id: TokenId, at: DateTime<Utc>) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens SET accessed_at = MAX(accessed_at, ?1) WHERE id = ?2",
                params![at.timestamp_millis(), id],
            )?;
            require_changed(changed, || StoreError::token_not_found(id))
        })
        .await
    }

    async fn mark_exhausted_if_empty(&self, id: TokenId) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens SET status = ?1 \
                 WHERE id = ?2 AND status = ?3 AND unlimited_quota = 0 AND remain_quota <= 0",
                params![
                    TokenStatus::Exhausted.code(),
                    id,
                    TokenStatus::Enabled.code()
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderType;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("open in-memory db")
    }

    #[tokio::test]
    async fn test_channel_round_trip_with_mapping() {
        let store = store();
        let draft = ChannelDraft::new("mapped", ProviderType::Anthropic, "sk-ant-1\nsk-ant-2")
            .with_models(["claude-3-5-sonnet", "claude-3-haiku"])
            .with_model_mapping("claude-3-5-sonnet", "claude-3-5-sonnet-20241022")
            .with_priority(7)
            .with_weight(3);
        let ids = store.insert_channels(vec![draft]).await.unwrap();
        assert_eq!(ids.len(), 2);

        let channel = store.get_channel(ids[1]).await.unwrap().unwrap();
        assert_eq!(channel.provider_type, ProviderType::Anthropic);
        assert_eq!(channel.key.expose_secret(), "sk-ant-2");
        assert_eq!(channel.models.len(), 2);
        assert_eq!(
            channel.upstream_model("claude-3-5-sonnet"),
            "claude-3-5-sonnet-20241022"
        );
        assert_eq!(channel.priority, 7);
        assert_eq!(channel.weight, 3);

        let candidates = store.channels_for_capability("claude-3-haiku").await.unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_counter_and_status_cas() {
        let store = store();
        let id = store
            .insert_channels(vec![
                ChannelDraft::new("c", ProviderType::OpenAI, "sk-x").with_models(["m"])
            ])
            .await
            .unwrap()[0];

        assert_eq!(store.record_failure(id).await.unwrap(), 1);
        assert_eq!(store.record_failure(id).await.unwrap(), 2);
        assert!(store
            .compare_and_set_status(id, ChannelStatus::Enabled, ChannelStatus::AutoDisabled)
            .await
            .unwrap());
        assert!(store.channels_for_capability("m").await.unwrap().is_empty());

        store.set_status(id, ChannelStatus::Enabled).await.unwrap();
        let channel = store.get_channel(id).await.unwrap().unwrap();
        assert_eq!(channel.status, ChannelStatus::Enabled);
        assert_eq!(channel.failure_count, 0);

        assert!(matches!(
            store.record_failure(999).await,
            Err(StoreError::NotFound { entity: "channel", .. })
        ));
    }

    #[tokio::test]
    async fn test_rebuild_and_delete_disabled() {
        let store = store();
        let ids = store
            .insert_channels(vec![
                ChannelDraft::new("a", ProviderType::OpenAI, "k1").with_models(["old"]),
                ChannelDraft::new("b", ProviderType::OpenAI, "k2").with_models(["old"]),
            ])
            .await
            .unwrap();

        store
            .rebuild_abilities(ids[0], vec!["new".into()])
            .await
            .unwrap();
        assert_eq!(store.channels_for_capability("old").await.unwrap().len(), 1);
        assert_eq!(store.channels_for_capability("new").await.unwrap().len(), 1);

        store
            .set_status(ids[1], ChannelStatus::ManuallyDisabled)
            .await
            .unwrap();
        assert_eq!(store.delete_disabled().await.unwrap(), 1);
        assert!(store.get_channel(ids[1]).await.unwrap().is_none());
        assert!(store.channels_for_capability("old").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_debit_leaves_balance_untouched() {
        let store = store();
        let id = store
            .insert_token(Token::new(1, "t", "tok-1").with_quota(100))
            .await
            .unwrap();

        assert!(!store.try_debit(id, 150).await.unwrap());
        assert_eq!(store.get_token(id).await.unwrap().unwrap().remain_quota, 100);

        assert!(store.try_debit(id, 70).await.unwrap());
        assert_eq!(store.debit_up_to(id, 50).await.unwrap(), 30);
        assert!(store.mark_exhausted_if_empty(id).await.unwrap());

        store.credit(id, 20).await.unwrap();
        let token = store.get_token(id).await.unwrap().unwrap();
        assert_eq!(token.remain_quota, 20);
        assert_eq!(token.used_quota, 80);
        assert_eq!(token.status, TokenStatus::Enabled);
    }

    #[tokio::test]
    async fn test_touch_is_monotonic() {
        let store = store();
        let id = store
            .insert_token(Token::new(1, "t", "tok-2").unlimited())
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::minutes(5);
        store.touch(id, later).await.unwrap();
        store.touch(id, later - chrono::Duration::hours(1)).await.unwrap();
        let token = store.get_token(id).await.unwrap().unwrap();
        assert_eq!(token.accessed_at.timestamp_millis(), later.timestamp_millis());
    }
}
