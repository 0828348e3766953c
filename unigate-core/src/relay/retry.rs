//! Backoff between failover attempts
//!
//! Each retry goes to a different channel, so the delay is only there to
//! soften bursts against a struggling provider; it is capped by
//! `max_delay_ms` even when an upstream asks for longer.

use crate::adaptor::AdaptorError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Base for exponential backoff (e.g., 2.0 for doubling)
    pub exponential_base: f64,

    /// Jitter factor (0.0 to 1.0) to randomize delays
    pub jitter_factor: f64,

    /// Prefer an upstream `Retry-After` hint over the computed delay
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            exponential_base: 2.0,
            jitter_factor: 0.1,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// Fail over immediately
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
            respect_retry_after: false,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-based) after `error`
    pub fn delay_for(&self, retry: u32, error: &AdaptorError) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);

        if self.respect_retry_after {
            if let Some(retry_after) = error.retry_after() {
                return retry_after.min(cap);
            }
        }

        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay_ms as f64 * self.exponential_base.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let delay_with_jitter = if self.jitter_factor > 0.0 && capped_delay > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter).clamp(0.0, self.max_delay_ms as f64)
        } else {
            capped_delay
        };

        Duration::from_millis(delay_with_jitter as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_error() -> AdaptorError {
        AdaptorError::Connect("refused".to_string())
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0, &transport_error()), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, &transport_error()), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, &transport_error()), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20, &transport_error()), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(1, &transport_error());
            assert!(delay >= Duration::from_millis(180));
            assert!(delay <= Duration::from_millis(220));
        }
    }

    #[test]
    fn test_retry_after_is_honored_but_capped() {
        let policy = RetryPolicy::default();
        let short = AdaptorError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        let long = AdaptorError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        };
        assert_eq!(policy.delay_for(0, &short), Duration::from_secs(2));
        assert_eq!(policy.delay_for(0, &long), Duration::from_secs(5));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate();
        let limited = AdaptorError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(policy.delay_for(3, &limited), Duration::ZERO);
    }
}
