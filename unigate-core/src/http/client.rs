//! HTTP client implementation using reqwest

use super::error::map_http_error;
use super::Transport;
use crate::adaptor::{AdaptorError, ByteStream, ProviderRequest, ProviderResponse};
use crate::config::ConnectionConfig;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, ClientBuilder, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum non-streaming response size
const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

const USER_AGENT: &str = concat!("unigate/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client with connection pooling
#[derive(Clone)]
pub struct HttpClient {
    client: Arc<Client>,

    /// Maximum response size to prevent OOM
    max_response_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client with default settings
    pub fn new() -> Result<Self, AdaptorError> {
        Self::with_config(&ConnectionConfig::default())
    }

    pub fn with_config(config: &ConnectionConfig) -> Result<Self, AdaptorError> {
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.keepalive_secs))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .map_err(|e| AdaptorError::Connect(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client: Arc::new(client),
            max_response_size: MAX_RESPONSE_SIZE,
        })
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<Response, AdaptorError> {
        debug!("POST {} (stream: {})", request.url, request.stream);

        let send = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .json(&request.body)
            .send();

        // The whole-request reqwest timeout would also cut long streams, so the
        // establishment bound is applied around `send` only.
        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| {
                warn!("Upstream {} did not respond within {:?}", request.url, timeout);
                AdaptorError::Timeout(timeout)
            })?
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.ok();
        warn!("Upstream {} answered {}", request.url, status);
        Err(map_http_error(status, Some(&headers), body))
    }

    /// Check response size to prevent OOM
    fn check_content_length(&self, response: &Response) -> Result<(), AdaptorError> {
        match response.content_length() {
            Some(len) if exceeds(len, self.max_response_size) => Err(AdaptorError::Protocol(
                format!(
                    "response size {} exceeds maximum {}",
                    len, self.max_response_size
                ),
            )),
            _ => Ok(()),
        }
    }
}

/// Whether a declared body length is over `max`, treating unrepresentable lengths as over
fn exceeds(len: u64, max: usize) -> bool {
    usize::try_from(len).map_or(true, |len| len > max)
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> AdaptorError {
    if e.is_timeout() {
        AdaptorError::Timeout(timeout)
    } else if e.is_connect() {
        AdaptorError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        AdaptorError::Interrupted(e.to_string())
    } else {
        AdaptorError::Connect(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderResponse, AdaptorError> {
        let started = tokio::time::Instant::now();
        let response = self.execute(request, timeout).await?;
        self.check_content_length(&response)?;

        let status = response.status().as_u16();
        let remaining = timeout.saturating_sub(started.elapsed());
        let body = tokio::time::timeout(remaining, response.bytes())
            .await
            .map_err(|_| AdaptorError::Timeout(timeout))?
            .map_err(|e| map_reqwest_error(e, timeout))?;

        if body.len() > self.max_response_size {
            return Err(AdaptorError::Protocol(format!(
                "response size {} exceeds maximum {}",
                body.len(),
                self.max_response_size
            )));
        }

        Ok(ProviderResponse { status, body })
    }

    async fn open_stream(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<ByteStream, AdaptorError> {
        let response = self.execute(request, timeout).await?;
        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| AdaptorError::Interrupted(e.to_string()))),
        ))
    }
}
