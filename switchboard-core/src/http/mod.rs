//! HTTP layer for upstream provider calls
//!
//! This module implements the transport seam of the gateway, handling:
//! - The provider-neutral [`OutboundRequest`] built by the transformer pipeline
//! - Buffered and streaming response bodies
//! - Error mapping from status codes and transport failures
//! - Request ID correlation

pub mod client;
pub mod error;

pub use client::HttpClient;
pub use error::map_http_error;

use crate::error::GatewayResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Raw upstream byte stream
pub type ByteStream = Pin<Box<dyn Stream<Item = GatewayResult<Bytes>> + Send>>;

/// A provider-shaped request ready to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Full endpoint URL
    pub url: String,

    /// Headers, keyed by lowercase name
    pub headers: BTreeMap<String, String>,

    /// JSON body
    pub body: Value,
}

impl OutboundRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&name.to_ascii_lowercase())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Per-call options
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Unique request ID for correlation
    pub request_id: Uuid,

    /// Provider the call goes to
    pub provider: String,

    /// Upstream model name
    pub model: String,

    /// Whether the response body should be streamed
    pub stream: bool,

    /// Optional per-request timeout overriding the client default
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(request_id: Uuid, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id,
            provider: provider.into(),
            model: model.into(),
            stream: false,
            timeout: None,
        }
    }

    /// Request a streamed body
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set the timeout for this request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Body of a successful upstream response
pub enum TransportBody {
    Buffered(Bytes),
    Stream(ByteStream),
}

impl fmt::Debug for TransportBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportBody::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            TransportBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A successful upstream response
#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: TransportBody,
}

/// Sends outbound requests
///
/// Non-success statuses come back as [`crate::GatewayError::Api`]; transport
/// failures as [`crate::GatewayError::Network`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: OutboundRequest,
        options: &RequestOptions,
    ) -> GatewayResult<TransportResponse>;
}
