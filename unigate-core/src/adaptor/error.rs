//! Errors raised while translating or exchanging a request with an upstream

use crate::model::ProviderType;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AdaptorError {
    /// The request uses a feature this provider cannot express
    #[error("unsupported by {provider}: {feature}")]
    UnsupportedCapability {
        provider: ProviderType,
        feature: String,
    },

    /// The upstream rejected the request shape itself
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        status: Option<u16>,
    },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    /// Response body or event stream broke off mid-way
    #[error("upstream response interrupted: {0}")]
    Interrupted(String),

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// The channel credential was refused
    #[error("upstream refused channel credential ({status}): {message}")]
    Authentication { status: u16, message: String },

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Body could not be decoded as the provider's wire format
    #[error("malformed upstream response: {0}")]
    Protocol(String),

    /// The channel record cannot be turned into a request (bad base URL, key bytes)
    #[error("channel misconfigured: {0}")]
    ChannelConfig(String),

    #[error("no adaptor registered for provider type {0}")]
    MissingAdaptor(ProviderType),
}

impl AdaptorError {
    pub fn unsupported(provider: ProviderType, feature: impl Into<String>) -> Self {
        AdaptorError::UnsupportedCapability {
            provider,
            feature: feature.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        AdaptorError::InvalidRequest {
            message: message.into(),
            status: None,
        }
    }

    /// Event stream closed before the provider's end marker
    pub fn truncated() -> Self {
        AdaptorError::Interrupted("stream ended before completion".to_string())
    }

    /// Failure local to the channel that produced it; another channel may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AdaptorError::UnsupportedCapability { .. } | AdaptorError::InvalidRequest { .. }
        )
    }

    /// Upstream hint for how long to wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdaptorError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status reported by the upstream, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            AdaptorError::InvalidRequest { status, .. } => *status,
            AdaptorError::RateLimited { .. } => Some(429),
            AdaptorError::Authentication { status, .. } | AdaptorError::Upstream { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AdaptorError {
    fn from(e: serde_json::Error) -> Self {
        AdaptorError::Protocol(e.to_string())
    }
}

pub type AdaptorResult<T> = Result<T, AdaptorError>;
