//! Secret handling for channel and token credentials
//!
//! Credentials are wrapped in [`SecretString`] so they never reach logs,
//! `Debug` output or caller-visible error messages by accident.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A wrapper type for sensitive strings like upstream API keys
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SecretString {
    value: String,
}

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Get the actual value (use with caution)
    pub fn expose_secret(&self) -> &str {
        &self.value
    }

    /// Empty or whitespace-only secrets are treated as absent
    pub fn is_blank(&self) -> bool {
        self.value.trim().is_empty()
    }

    /// Get a partially redacted version for diagnostics
    pub fn partial_redact(&self) -> String {
        if self.value.is_empty() {
            return "[EMPTY]".to_string();
        }

        let len = self.value.chars().count();
        if len <= 8 {
            "[REDACTED]".to_string()
        } else if self.value.starts_with("sk-") {
            let tail: String = self.value.chars().skip(len - 4).collect();
            format!("sk-...{}", tail)
        } else {
            let head: String = self.value.chars().take(2).collect();
            let tail: String = self.value.chars().skip(len - 2).collect();
            format!("{}...{}", head, tail)
        }
    }

    /// Replace every occurrence of this secret inside `text`.
    ///
    /// Upstreams sometimes echo the offending key back in error bodies.
    pub fn scrub(&self, text: &str) -> String {
        if self.is_blank() || !text.contains(&self.value) {
            return text.to_string();
        }
        text.replace(&self.value, &self.partial_redact())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
