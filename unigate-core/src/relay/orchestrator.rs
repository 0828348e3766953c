//! Request relay with failover
//!
//! Per request: check the token, find candidate channels, then loop
//! select → reserve → dispatch until an attempt succeeds, a request-shape error
//! ends it, or the attempt budget runs out. Each failed attempt refunds its
//! reservation, counts against the channel's health and is audited.

use super::error::RelayError;
use super::health::ChannelHealth;
use super::ledger::QuotaLedger;
use super::pricing::{QuotaPricing, TokenRatioPricing};
use super::selector::ChannelSelector;
use super::stream::{relay_stream, RelayStream, StreamSettlement};
use crate::adaptor::{AdaptorError, AdaptorRegistry, AdaptorResult, ChatStream};
use crate::audit::{AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use crate::config::{GatewayConfig, HealthConfig, QuotaConfig, RelayConfig};
use crate::http::{HttpClient, Transport};
use crate::model::{Channel, ChannelId, Token};
use crate::protocol::{estimate_tokens, ChatRequest, ChatResponse, ChatStreamChunk, Usage};
use crate::store::{ChannelStore, TokenStore};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Result of a successful relay
#[derive(Debug)]
pub enum RelayOutcome {
    Complete(ChatResponse),
    Stream(RelayStream),
}

enum Attempt {
    Complete(ChatResponse, Usage),
    Stream(ChatStreamChunk, ChatStream),
}

/// Identity of one relay, threaded through attempts for logs and audit
struct RequestContext<'a> {
    request_id: String,
    token: &'a Token,
    request: &'a ChatRequest,
    prompt_tokens: u32,
}

pub struct Relay {
    selector: ChannelSelector,
    health: ChannelHealth,
    ledger: Arc<QuotaLedger>,
    tokens: Arc<dyn TokenStore>,
    adaptors: AdaptorRegistry,
    transport: Arc<dyn Transport>,
    pricing: Arc<dyn QuotaPricing>,
    audit: Arc<dyn AuditSink>,
    config: RelayConfig,
}

impl Relay {
    pub fn builder(
        channels: Arc<dyn ChannelStore>,
        tokens: Arc<dyn TokenStore>,
        transport: Arc<dyn Transport>,
    ) -> RelayBuilder {
        RelayBuilder {
            channels,
            tokens,
            transport,
            adaptors: None,
            pricing: None,
            audit: None,
            relay: RelayConfig::default(),
            health: HealthConfig::default(),
            quota: QuotaConfig::default(),
            seed: None,
        }
    }

    /// Relay wired from a loaded configuration over the shared HTTP client
    pub fn from_config(
        config: &GatewayConfig,
        channels: Arc<dyn ChannelStore>,
        tokens: Arc<dyn TokenStore>,
    ) -> AdaptorResult<Self> {
        let transport = Arc::new(HttpClient::with_config(&config.connection)?);
        Ok(Self::builder(channels, tokens, transport)
            .with_relay_config(config.relay.clone())
            .with_health_config(config.health.clone())
            .with_quota_config(config.quota.clone())
            .build())
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// Relay `request` on behalf of `token`
    pub async fn relay(
        &self,
        request: ChatRequest,
        token: &Token,
    ) -> Result<RelayOutcome, RelayError> {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "relay",
            request_id = %request_id,
            token_id = token.id,
            model = %request.model,
            stream = request.stream,
        );
        self.run(request_id, &request, token).instrument(span).await
    }

    async fn run(
        &self,
        request_id: String,
        request: &ChatRequest,
        token: &Token,
    ) -> Result<RelayOutcome, RelayError> {
        validate_request(request)?;

        let now = Utc::now();
        token.check_usable(now)?;
        if let Err(e) = self.tokens.touch(token.id, now).await {
            warn!("Failed to touch token {}: {}", token.id, e);
        }

        info!("Relaying request {}", request_id);
        let candidates = self.selector.candidates_for(&request.model).await?;
        let estimate = self.pricing.estimate(request);
        let budget = self
            .config
            .max_attempts
            .min(u32::try_from(candidates.len()).unwrap_or(u32::MAX));

        let ctx = RequestContext {
            request_id,
            token,
            request,
            prompt_tokens: request.estimated_prompt_tokens(),
        };
        let mut tried: HashSet<ChannelId> = HashSet::new();
        let mut last_error: Option<(AdaptorError, RelayError)> = None;
        let mut attempts = 0;

        while attempts < budget {
            let Some(channel) = self.selector.select_next(&candidates, &tried) else {
                break;
            };
            tried.insert(channel.id);

            if let Some((cause, _)) = &last_error {
                let delay = self.config.retry.delay_for(attempts - 1, cause);
                if !delay.is_zero() {
                    debug!("Backing off {:?} before next channel", delay);
                    tokio::time::sleep(delay).await;
                }
            }
            attempts += 1;

            debug!(
                "Attempt {}/{} on channel {} ({}, priority {})",
                attempts, budget, channel.id, channel.name, channel.priority
            );
            let guard = self.ledger.reserve_guarded(token.id, estimate).await?;
            let started = Instant::now();

            match self.attempt(request, &channel).await {
                Ok(Attempt::Complete(mut response, usage)) => {
                    let usage = effective_usage(usage, &response, ctx.prompt_tokens);
                    let cost = self.pricing.cost(&request.model, &usage);
                    let settlement = guard.settle(cost).await?;
                    let charged = settlement.map_or(0, |s| s.charged);
                    self.health.record_success(&channel).await;

                    if response.model.is_empty() {
                        response.model = request.model.clone();
                    }
                    response.usage.get_or_insert(usage);

                    info!(
                        "Request {} served by channel {} (cost {})",
                        ctx.request_id, channel.id, charged
                    );
                    self.record(
                        &ctx,
                        &channel,
                        attempts,
                        started,
                        AuditOutcome::Succeeded,
                        charged,
                        Some(usage),
                    );
                    return Ok(RelayOutcome::Complete(response));
                }
                Ok(Attempt::Stream(first, rest)) => {
                    self.health.record_success(&channel).await;
                    info!(
                        "Request {} streaming from channel {}",
                        ctx.request_id, channel.id
                    );
                    let settlement = StreamSettlement {
                        request_id: ctx.request_id.clone(),
                        token_id: token.id,
                        capability: request.model.clone(),
                        attempt: attempts,
                        prompt_tokens: ctx.prompt_tokens,
                        started,
                        guard,
                        pricing: Arc::clone(&self.pricing),
                        audit: Arc::clone(&self.audit),
                        channel,
                    };
                    return Ok(RelayOutcome::Stream(relay_stream(first, rest, settlement)));
                }
                Err(cause) => {
                    if let Err(e) = guard.refund().await {
                        warn!("Refund after failed attempt did not complete: {}", e);
                    }

                    let mut error = RelayError::from(cause.clone());
                    error.message = channel.key.scrub(&error.message);
                    let outcome = AuditOutcome::Failed {
                        kind: error.kind,
                        upstream_status: error.upstream_status,
                        message: error.message.clone(),
                    };
                    self.record(&ctx, &channel, attempts, started, outcome, 0, None);

                    if !cause.is_retryable() {
                        info!("Request {} rejected: {}", ctx.request_id, error);
                        return Err(error);
                    }

                    warn!(
                        "Channel {} ({}) failed: {}",
                        channel.id, channel.name, error
                    );
                    self.health.record_failure(&channel).await;
                    last_error = Some((cause, error));
                }
            }
        }

        let exhausted = RelayError::exhausted(attempts, last_error.as_ref().map(|(_, e)| e));
        warn!("Request {} failed: {}", ctx.request_id, exhausted);
        Err(exhausted)
    }

    async fn attempt(&self, request: &ChatRequest, channel: &Channel) -> AdaptorResult<Attempt> {
        let adaptor = self.adaptors.get(channel.provider_type)?;
        let upstream_request = adaptor.build_request(request, channel)?;
        let timeout = self.config.dispatch_timeout();

        if !request.stream {
            let response = adaptor
                .dispatch(self.transport.as_ref(), upstream_request, timeout)
                .await?;
            let (response, usage) = adaptor.parse_response(response)?;
            return Ok(Attempt::Complete(response, usage));
        }

        let started = Instant::now();
        let mut stream = adaptor
            .dispatch_stream(self.transport.as_ref(), upstream_request, timeout)
            .await?;
        // Failover stays possible until the first chunk arrives
        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(first))) => Ok(Attempt::Stream(first, stream)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(AdaptorError::Interrupted(
                "stream closed before the first chunk".to_string(),
            )),
            Err(_) => Err(AdaptorError::Timeout(timeout)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        ctx: &RequestContext<'_>,
        channel: &Channel,
        attempt: u32,
        started: Instant,
        outcome: AuditOutcome,
        cost_delta: i64,
        usage: Option<Usage>,
    ) {
        self.audit.record(AuditEvent {
            timestamp: Utc::now(),
            request_id: ctx.request_id.clone(),
            token_id: ctx.token.id,
            channel_id: channel.id,
            capability: ctx.request.model.clone(),
            attempt,
            stream: ctx.request.stream,
            outcome,
            cost_delta,
            usage,
            latency_ms: elapsed_ms(started),
        });
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("adaptors", &self.adaptors)
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_request(request: &ChatRequest) -> Result<(), RelayError> {
    if request.model.trim().is_empty() {
        return Err(RelayError::invalid_request("model is required"));
    }
    if request.messages.is_empty() {
        return Err(RelayError::invalid_request("messages must not be empty"));
    }
    if request.n == Some(0) {
        return Err(RelayError::invalid_request("n must be at least 1"));
    }
    Ok(())
}

/// Upstream usage, or an estimate when the upstream reported none
fn effective_usage(reported: Usage, response: &ChatResponse, prompt_tokens: u32) -> Usage {
    if reported.total_tokens > 0 {
        return reported;
    }
    let completion_chars: usize = response
        .choices
        .iter()
        .map(|choice| choice.message.content.joined_text().chars().count())
        .sum();
    Usage::new(prompt_tokens, estimate_tokens(completion_chars))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Assembles a [`Relay`]; defaults match an empty configuration file
pub struct RelayBuilder {
    channels: Arc<dyn ChannelStore>,
    tokens: Arc<dyn TokenStore>,
    transport: Arc<dyn Transport>,
    adaptors: Option<AdaptorRegistry>,
    pricing: Option<Arc<dyn QuotaPricing>>,
    audit: Option<Arc<dyn AuditSink>>,
    relay: RelayConfig,
    health: HealthConfig,
    quota: QuotaConfig,
    seed: Option<u64>,
}

impl RelayBuilder {
    pub fn with_adaptors(mut self, adaptors: AdaptorRegistry) -> Self {
        self.adaptors = Some(adaptors);
        self
    }

    /// Replaces the token-ratio pricing derived from the quota config
    pub fn with_pricing(mut self, pricing: Arc<dyn QuotaPricing>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_relay_config(mut self, config: RelayConfig) -> Self {
        self.relay = config;
        self
    }

    pub fn with_health_config(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    pub fn with_quota_config(mut self, config: QuotaConfig) -> Self {
        self.quota = config;
        self
    }

    /// Seed channel selection for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Relay {
        let selector = match self.seed {
            Some(seed) => ChannelSelector::with_seed(Arc::clone(&self.channels), seed),
            None => ChannelSelector::new(Arc::clone(&self.channels)),
        };
        let pricing = self
            .pricing
            .unwrap_or_else(|| Arc::new(TokenRatioPricing::new(self.quota)));

        Relay {
            selector,
            health: ChannelHealth::new(self.channels, self.health),
            ledger: Arc::new(QuotaLedger::new(Arc::clone(&self.tokens))),
            tokens: self.tokens,
            adaptors: self.adaptors.unwrap_or_else(AdaptorRegistry::with_defaults),
            transport: self.transport,
            pricing,
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            config: self.relay,
        }
    }
}
