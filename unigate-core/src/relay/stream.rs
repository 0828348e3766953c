//! Caller-facing stream of an established upstream stream
//!
//! The reservation stays open while chunks flow and is resolved exactly once
//! when the stream ends, breaks or is dropped: refunded if the caller never
//! received a chunk, otherwise settled on the usage the upstream reported or,
//! failing that, on an estimate from the delivered text.

use super::error::RelayError;
use super::ledger::ReservationGuard;
use super::pricing::QuotaPricing;
use crate::adaptor::{AdaptorError, ChatStream};
use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::model::{Channel, ChannelId, TokenId};
use crate::protocol::{estimate_tokens, ChatStreamChunk, Usage};
use async_stream::stream;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tracing::{error, info, warn};

type Chunks = Pin<Box<dyn Stream<Item = Result<ChatStreamChunk, RelayError>> + Send>>;

/// Canonical chunks of a relayed stream; ends with at most one error item
pub struct RelayStream {
    request_id: String,
    channel_id: ChannelId,
    inner: Chunks,
}

impl RelayStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Channel serving this stream
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }
}

impl Stream for RelayStream {
    type Item = Result<ChatStreamChunk, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("request_id", &self.request_id)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

/// Everything needed to close the books on a stream
pub(crate) struct StreamSettlement {
    pub request_id: String,
    pub token_id: TokenId,
    pub channel: Channel,
    pub capability: String,
    pub attempt: u32,
    pub prompt_tokens: u32,
    pub started: Instant,
    pub guard: ReservationGuard,
    pub pricing: Arc<dyn QuotaPricing>,
    pub audit: Arc<dyn AuditSink>,
}

enum StreamEnd {
    Completed,
    Interrupted(String),
    Cancelled,
}

#[derive(Default)]
struct Delivered {
    chunks: u64,
    chars: usize,
    usage: Option<Usage>,
}

impl Delivered {
    fn observe(&mut self, chunk: &ChatStreamChunk) {
        self.chunks += 1;
        self.chars += chunk.delta_text().chars().count();
        if let Some(usage) = chunk.usage {
            self.usage = Some(self.usage.map_or(usage, |seen| seen.merge(usage)));
        }
    }
}

struct Settler {
    pending: Option<StreamSettlement>,
    delivered: Delivered,
}

impl Settler {
    fn error(&self, e: AdaptorError) -> RelayError {
        let mut error = RelayError::from(e);
        if let Some(pending) = &self.pending {
            error.message = pending.channel.key.scrub(&error.message);
        }
        error
    }

    async fn finish(&mut self, end: StreamEnd) {
        if let Some(pending) = self.pending.take() {
            conclude(pending, end, std::mem::take(&mut self.delivered)).await;
        }
    }
}

impl Drop for Settler {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let delivered = std::mem::take(&mut self.delivered);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(conclude(pending, StreamEnd::Cancelled, delivered));
            }
            Err(_) => warn!(
                request_id = %pending.request_id,
                "Stream dropped outside a runtime; settlement skipped"
            ),
        }
    }
}

async fn conclude(pending: StreamSettlement, end: StreamEnd, delivered: Delivered) {
    let StreamSettlement {
        request_id,
        token_id,
        channel,
        capability,
        attempt,
        prompt_tokens,
        started,
        guard,
        pricing,
        audit,
    } = pending;

    let (cost, usage) = if delivered.chunks == 0 {
        if let Err(e) = guard.refund().await {
            error!(request_id = %request_id, "Refund of unused stream reservation failed: {}", e);
        }
        (0, None)
    } else {
        let usage = delivered
            .usage
            .filter(|usage| usage.total_tokens > 0)
            .unwrap_or_else(|| Usage::new(prompt_tokens, estimate_tokens(delivered.chars)));
        let cost = pricing.cost(&capability, &usage);
        let charged = match guard.settle(cost).await {
            Ok(settlement) => settlement.map_or(0, |s| s.charged),
            Err(e) => {
                error!(request_id = %request_id, "Stream settlement failed: {}", e);
                cost
            }
        };
        (charged, Some(usage))
    };

    let outcome = match end {
        StreamEnd::Completed => AuditOutcome::Succeeded,
        StreamEnd::Interrupted(message) => AuditOutcome::Interrupted { message },
        StreamEnd::Cancelled => AuditOutcome::Cancelled,
    };
    info!(
        request_id = %request_id,
        channel_id = channel.id,
        chunks = delivered.chunks,
        cost,
        "Stream finished: {:?}",
        outcome
    );

    audit.record(AuditEvent {
        timestamp: Utc::now(),
        request_id,
        token_id,
        channel_id: channel.id,
        capability,
        attempt,
        stream: true,
        outcome,
        cost_delta: cost,
        usage,
        latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    });
}

/// Forward `first` and the rest of an established upstream stream
pub(crate) fn relay_stream(
    first: ChatStreamChunk,
    mut rest: ChatStream,
    settlement: StreamSettlement,
) -> RelayStream {
    let request_id = settlement.request_id.clone();
    let channel_id = settlement.channel.id;
    let log_id = request_id.clone();
    let mut settler = Settler {
        pending: Some(settlement),
        delivered: Delivered::default(),
    };

    let inner = stream! {
        settler.delivered.observe(&first);
        yield Ok(first);

        while let Some(item) = rest.next().await {
            match item {
                Ok(chunk) => {
                    settler.delivered.observe(&chunk);
                    yield Ok(chunk);
                }
                Err(e) => {
                    let error = settler.error(e);
                    warn!(
                        request_id = %log_id,
                        "Stream interrupted after {} chunk(s): {}",
                        settler.delivered.chunks,
                        error
                    );
                    settler.finish(StreamEnd::Interrupted(error.message.clone())).await;
                    yield Err(error);
                    return;
                }
            }
        }
        settler.finish(StreamEnd::Completed).await;
    };

    RelayStream {
        request_id,
        channel_id,
        inner: Box::pin(inner),
    }
}
