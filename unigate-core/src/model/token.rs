//! Caller tokens and their quota balances

use crate::config::SecretString;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TokenId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    /// Limited token whose balance ran out
    Exhausted,
}

impl TokenStatus {
    pub fn code(&self) -> u8 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TokenStatus::Enabled),
            2 => Some(TokenStatus::Disabled),
            3 => Some(TokenStatus::Expired),
            4 => Some(TokenStatus::Exhausted),
            _ => None,
        }
    }
}

/// Why a token cannot start a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Disabled,
    Expired,
    Exhausted,
}

/// A caller credential, already authenticated by the time it reaches the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,

    pub user_id: i64,

    pub name: String,

    pub key: SecretString,

    pub status: TokenStatus,

    /// May only go negative when `unlimited_quota` is set
    pub remain_quota: i64,

    pub used_quota: i64,

    pub unlimited_quota: bool,

    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,

    pub accessed_at: DateTime<Utc>,
}

impl Token {
    pub fn new(user_id: i64, name: impl Into<String>, key: impl Into<SecretString>) -> Self {
        Self {
            id: 0,
            user_id,
            name: name.into(),
            key: key.into(),
            status: TokenStatus::Enabled,
            remain_quota: 0,
            used_quota: 0,
            unlimited_quota: false,
            expires_at: None,
            accessed_at: Utc::now(),
        }
    }

    pub fn with_quota(mut self, quota: i64) -> Self {
        self.remain_quota = quota;
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.unlimited_quota = true;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check whether this token may initiate a relay at `now`
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<(), TokenRejection> {
        match self.status {
            TokenStatus::Disabled => return Err(TokenRejection::Disabled),
            TokenStatus::Expired => return Err(TokenRejection::Expired),
            TokenStatus::Exhausted if !self.unlimited_quota => {
                return Err(TokenRejection::Exhausted)
            }
            _ => {}
        }
        if matches!(self.expires_at, Some(expiry) if expiry <= now) {
            return Err(TokenRejection::Expired);
        }
        Ok(())
    }
}
