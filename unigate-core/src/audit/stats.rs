//! Usage statistics aggregated from audit events
//!
//! Counts calls, outcomes, tokens and quota per requested model, per channel,
//! per caller token and per UTC day. Plug it in as an [`AuditSink`] (alone or through a fan-out) and
//! read a [`UsageReport`] snapshot whenever needed.

use super::{AuditEvent, AuditOutcome, AuditSink};
use crate::model::{ChannelId, TokenId};
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UsageSummary {
    pub calls: u64,
    /// Completed calls only
    pub successes: u64,
    /// Streams that broke off after delivering chunks
    pub interrupted: u64,
    /// Streams the caller dropped
    pub cancelled: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub quota: i64,
}

impl UsageSummary {
    fn add(&mut self, event: &AuditEvent) {
        self.calls += 1;
        match event.outcome {
            AuditOutcome::Succeeded => self.successes += 1,
            AuditOutcome::Interrupted { .. } => self.interrupted += 1,
            AuditOutcome::Cancelled => self.cancelled += 1,
            AuditOutcome::Failed { .. } => self.failures += 1,
        }
        if let Some(usage) = event.usage {
            self.prompt_tokens += u64::from(usage.prompt_tokens);
            self.completion_tokens += u64::from(usage.completion_tokens);
        }
        self.quota = self.quota.saturating_add(event.cost_delta);
    }

    /// Share of calls that completed, `None` before the first call
    pub fn success_rate(&self) -> Option<f64> {
        (self.calls > 0).then(|| self.successes as f64 / self.calls as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageReport {
    pub total: UsageSummary,
    pub by_capability: BTreeMap<String, UsageSummary>,
    pub by_channel: BTreeMap<ChannelId, UsageSummary>,
    pub by_token: BTreeMap<TokenId, UsageSummary>,
    /// Keyed by the UTC date of the attempt
    pub by_day: BTreeMap<NaiveDate, UsageSummary>,
}

#[derive(Debug, Default)]
pub struct UsageStats {
    report: Mutex<UsageReport>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, event: &AuditEvent) {
        let mut report = self.report.lock();
        report.total.add(event);
        report
            .by_capability
            .entry(event.capability.clone())
            .or_default()
            .add(event);
        report
            .by_channel
            .entry(event.channel_id)
            .or_default()
            .add(event);
        report
            .by_token
            .entry(event.token_id)
            .or_default()
            .add(event);
        report
            .by_day
            .entry(event.timestamp.date_naive())
            .or_default()
            .add(event);
    }

    pub fn snapshot(&self) -> UsageReport {
        self.report.lock().clone()
    }

    pub fn reset(&self) {
        *self.report.lock() = UsageReport::default();
    }
}

impl AuditSink for UsageStats {
    fn record(&self, event: AuditEvent) {
        self.observe(&event);
    }
}
