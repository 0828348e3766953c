//! Quota cost of a request
//!
//! Quota units are tokens scaled by a per-model ratio. Before dispatch only
//! the prompt is known, so the reservation is a flat pre-consumed amount plus
//! the estimated prompt cost; settlement uses the reported usage.

use crate::config::QuotaConfig;
use crate::protocol::{ChatRequest, Usage};

pub trait QuotaPricing: Send + Sync {
    /// Amount to reserve before dispatching `request`
    fn estimate(&self, request: &ChatRequest) -> i64;

    /// Final cost of `usage` on `model`
    fn cost(&self, model: &str, usage: &Usage) -> i64;
}

#[derive(Debug, Clone, Default)]
pub struct TokenRatioPricing {
    config: QuotaConfig,
}

impl TokenRatioPricing {
    pub fn new(config: QuotaConfig) -> Self {
        Self { config }
    }
}

fn to_quota(value: f64) -> i64 {
    if value.is_finite() && value > 0.0 {
        value.ceil().min(i64::MAX as f64) as i64
    } else {
        0
    }
}

impl QuotaPricing for TokenRatioPricing {
    fn estimate(&self, request: &ChatRequest) -> i64 {
        let ratio = self.config.ratio_for(&request.model);
        let prompt = f64::from(request.estimated_prompt_tokens()) * ratio;
        self.config.pre_consume_quota.saturating_add(to_quota(prompt))
    }

    fn cost(&self, model: &str, usage: &Usage) -> i64 {
        let ratio = self.config.ratio_for(model);
        let weighted = f64::from(usage.prompt_tokens)
            + f64::from(usage.completion_tokens) * self.config.completion_ratio;
        to_quota(weighted * ratio)
    }
}
