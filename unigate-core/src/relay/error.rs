//! Caller-visible relay errors

use super::ledger::LedgerError;
use crate::adaptor::AdaptorError;
use crate::model::TokenRejection;
use crate::store::StoreError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Stable classification of a failed relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayErrorKind {
    InvalidToken,
    InsufficientQuota,
    NoEligibleChannel,
    UnsupportedCapability,
    InvalidRequest,
    TransportError,
    ProtocolError,
    Exhausted,
    Storage,
}

impl RelayErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayErrorKind::InvalidToken => "invalid_token",
            RelayErrorKind::InsufficientQuota => "insufficient_quota",
            RelayErrorKind::NoEligibleChannel => "no_eligible_channel",
            RelayErrorKind::UnsupportedCapability => "unsupported_capability",
            RelayErrorKind::InvalidRequest => "invalid_request",
            RelayErrorKind::TransportError => "transport_error",
            RelayErrorKind::ProtocolError => "protocol_error",
            RelayErrorKind::Exhausted => "exhausted",
            RelayErrorKind::Storage => "storage",
        }
    }

    /// Whether another channel could still succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayErrorKind::TransportError | RelayErrorKind::ProtocolError
        )
    }
}

impl fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RelayError {
    pub kind: RelayErrorKind,

    pub message: String,

    /// Last HTTP status reported by an upstream, if any
    pub upstream_status: Option<u16>,
}

impl RelayError {
    pub fn new(kind: RelayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_status: None,
        }
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.upstream_status = status;
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::InvalidRequest, message)
    }

    pub fn no_eligible_channel(capability: &str) -> Self {
        Self::new(
            RelayErrorKind::NoEligibleChannel,
            format!("no enabled channel serves '{}'", capability),
        )
    }

    /// Every selected channel failed; carries the last upstream failure
    pub fn exhausted(attempts: u32, last: Option<&RelayError>) -> Self {
        let message = match last {
            Some(last) => format!("all {} attempt(s) failed, last: {}", attempts, last.message),
            None => "no channel left to try".to_string(),
        };
        Self::new(RelayErrorKind::Exhausted, message)
            .with_status(last.and_then(|last| last.upstream_status))
    }
}

impl From<AdaptorError> for RelayError {
    fn from(e: AdaptorError) -> Self {
        let kind = match &e {
            AdaptorError::UnsupportedCapability { .. } => RelayErrorKind::UnsupportedCapability,
            AdaptorError::InvalidRequest { .. } => RelayErrorKind::InvalidRequest,
            AdaptorError::Protocol(_) => RelayErrorKind::ProtocolError,
            _ => RelayErrorKind::TransportError,
        };
        RelayError::new(kind, e.to_string()).with_status(e.status())
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::new(RelayErrorKind::Storage, e.to_string())
    }
}

impl From<LedgerError> for RelayError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientQuota { .. } => {
                RelayError::new(RelayErrorKind::InsufficientQuota, e.to_string())
            }
            LedgerError::Store(e) => e.into(),
        }
    }
}

impl From<TokenRejection> for RelayError {
    fn from(rejection: TokenRejection) -> Self {
        match rejection {
            TokenRejection::Exhausted => {
                RelayError::new(RelayErrorKind::InsufficientQuota, "token quota is exhausted")
            }
            TokenRejection::Disabled => {
                RelayError::new(RelayErrorKind::InvalidToken, "token is disabled")
            }
            TokenRejection::Expired => {
                RelayError::new(RelayErrorKind::InvalidToken, "token has expired")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_case::test_case;

    #[test_case(AdaptorError::Connect("x".into()), RelayErrorKind::TransportError ; "connect")]
    #[test_case(AdaptorError::Timeout(Duration::from_secs(1)), RelayErrorKind::TransportError ; "timeout")]
    #[test_case(AdaptorError::RateLimited { retry_after: None }, RelayErrorKind::TransportError ; "rate limited")]
    #[test_case(AdaptorError::truncated(), RelayErrorKind::TransportError ; "truncated stream")]
    #[test_case(
        AdaptorError::Authentication { status: 401, message: String::new() },
        RelayErrorKind::TransportError ;
        "auth"
    )]
    #[test_case(
        AdaptorError::MissingAdaptor(crate::model::ProviderType::Gemini),
        RelayErrorKind::TransportError ;
        "missing adaptor"
    )]
    #[test_case(AdaptorError::Protocol("x".into()), RelayErrorKind::ProtocolError ; "protocol")]
    #[test_case(AdaptorError::invalid_request("x"), RelayErrorKind::InvalidRequest ; "invalid request")]
    #[test_case(
        AdaptorError::unsupported(crate::model::ProviderType::Gemini, "n"),
        RelayErrorKind::UnsupportedCapability ;
        "unsupported"
    )]
    fn test_adaptor_error_kinds(error: AdaptorError, expected: RelayErrorKind) {
        let retryable = error.is_retryable();
        let relay_error = RelayError::from(error);
        assert_eq!(relay_error.kind, expected);
        assert_eq!(relay_error.kind.is_retryable(), retryable);
    }

    #[test]
    fn test_exhausted_keeps_last_status() {
        let last = RelayError::from(AdaptorError::Upstream {
            status: 503,
            message: "overloaded".to_string(),
        });
        let exhausted = RelayError::exhausted(2, Some(&last));
        assert_eq!(exhausted.kind, RelayErrorKind::Exhausted);
        assert_eq!(exhausted.upstream_status, Some(503));
        assert!(exhausted.message.contains("overloaded"));
    }

    #[test]
    fn test_token_rejections() {
        assert_eq!(
            RelayError::from(TokenRejection::Expired).kind,
            RelayErrorKind::InvalidToken
        );
        assert_eq!(
            RelayError::from(TokenRejection::Exhausted).kind,
            RelayErrorKind::InsufficientQuota
        );
    }
}
