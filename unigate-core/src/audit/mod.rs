//! Per-attempt audit events
//!
//! The relay records one [`AuditEvent`] per channel attempt. Sinks must never
//! block the request path: they either log, buffer in memory, or hand the
//! event to a bounded channel and drop it when the consumer falls behind.

mod stats;

pub use stats::{UsageReport, UsageStats, UsageSummary};

use crate::config::AuditConfig;
use crate::model::{ChannelId, TokenId};
use crate::protocol::Usage;
use crate::relay::RelayErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How one attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Complete response returned, or stream ran to its end
    Succeeded,

    /// Stream broke off after chunks were delivered; observed usage was settled
    Interrupted { message: String },

    /// Caller dropped the stream
    Cancelled,

    /// The channel failed; the reservation was refunded
    Failed {
        kind: RelayErrorKind,
        upstream_status: Option<u16>,
        message: String,
    },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, AuditOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,

    pub request_id: String,

    pub token_id: TokenId,

    pub channel_id: ChannelId,

    /// Requested model name
    pub capability: String,

    /// 1-based attempt number within the request
    pub attempt: u32,

    pub stream: bool,

    pub outcome: AuditOutcome,

    /// Quota finally charged for this attempt
    pub cost_delta: i64,

    pub usage: Option<Usage>,

    pub latency_ms: u64,
}

/// Fire-and-forget destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes every event as a structured `info` line
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let usage = event.usage.unwrap_or_default();
        info!(
            target: "unigate::audit",
            request_id = %event.request_id,
            token_id = event.token_id,
            channel_id = event.channel_id,
            capability = %event.capability,
            attempt = event.attempt,
            stream = event.stream,
            success = event.outcome.is_success(),
            cost = event.cost_delta,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            latency_ms = event.latency_ms,
            "relay attempt"
        );
    }
}

/// Forwards events into a bounded tokio channel, dropping them when full
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelAuditSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let sink = Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, receiver)
    }

    pub fn from_config(config: &AuditConfig) -> (Self, mpsc::Receiver<AuditEvent>) {
        Self::new(config.buffer)
    }

    /// Events lost because the receiver was full or gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.sender.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // Log at 1, 2, 4, 8... drops
            if dropped.is_power_of_two() {
                warn!("Audit event dropped ({} so far): {}", dropped, e);
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Delivers each event to several sinks
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
