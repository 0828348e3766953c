//! HTTP transport for upstream calls
//!
//! This module implements the network layer of the relay engine:
//! - Connection pooling and client management
//! - Per-call timeouts
//! - Mapping of HTTP failures onto [`AdaptorError`]

pub mod client;
pub mod error;

pub use client::HttpClient;

use crate::adaptor::{AdaptorError, ByteStream, ProviderRequest, ProviderResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Network exchange with an upstream.
///
/// Implementations return `Ok` only for 2xx answers; every other status is
/// mapped to an [`AdaptorError`] via [`error::map_http_error`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and read the whole body within `timeout`
    async fn send(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<ProviderResponse, AdaptorError>;

    /// Send a request and return the body as a stream once headers arrive.
    ///
    /// `timeout` bounds the wait for response headers; the body itself may
    /// take as long as the upstream keeps the stream open.
    async fn open_stream(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<ByteStream, AdaptorError>;
}
