//! HTTP client implementation using reqwest

use super::error::{map_http_error, map_transport_error};
use super::{OutboundRequest, RequestOptions, Transport, TransportBody, TransportResponse};
use crate::config::ConnectionConfig;
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, ClientBuilder, Proxy, Response};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum buffered response size
const MAX_RESPONSE_SIZE: usize = 32 * 1024 * 1024;

/// Default user agent
const USER_AGENT: &str = concat!("switchboard/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client with connection pooling
#[derive(Clone)]
pub struct HttpClient {
    /// The underlying reqwest client
    client: Arc<Client>,

    /// Maximum response size to prevent OOM
    max_response_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client with default settings
    pub fn new() -> GatewayResult<Self> {
        Self::with_config(&ConnectionConfig::default())
    }

    /// Create a new HTTP client from connection settings
    pub fn with_config(config: &ConnectionConfig) -> GatewayResult<Self> {
        let mut builder = ClientBuilder::new()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.keepalive_secs))
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .gzip(true);

        if let Some(proxy_url) = &config.proxy_url {
            url::Url::parse(proxy_url).map_err(|e| {
                GatewayError::configuration(format!("Invalid proxy URL '{}': {}", proxy_url, e))
            })?;
            let proxy = Proxy::all(proxy_url).map_err(|e| {
                GatewayError::configuration(format!("Invalid proxy URL '{}': {}", proxy_url, e))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            GatewayError::configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client: Arc::new(client),
            max_response_size: MAX_RESPONSE_SIZE,
        })
    }

    /// Override the buffered response limit
    pub fn with_max_response_size(mut self, max_response_size: usize) -> Self {
        self.max_response_size = max_response_size;
        self
    }

    /// Check response size to prevent OOM
    fn check_content_length(&self, response: &Response, options: &RequestOptions) -> GatewayResult<()> {
        if let Some(content_length) = response.content_length() {
            if content_length as usize > self.max_response_size {
                return Err(self.too_large(content_length as usize, options));
            }
        }
        Ok(())
    }

    fn too_large(&self, size: usize, options: &RequestOptions) -> GatewayError {
        GatewayError::Api {
            status: 502,
            provider: options.provider.clone(),
            model: options.model.clone(),
            message: format!(
                "Response size {} exceeds maximum {} [request_id: {}]",
                size, self.max_response_size, options.request_id
            ),
            details: None,
        }
    }
}

fn collect_headers(response: &Response) -> BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(
        &self,
        request: OutboundRequest,
        options: &RequestOptions,
    ) -> GatewayResult<TransportResponse> {
        let request_id = options.request_id;
        debug!(
            request_id = %request_id,
            provider = %options.provider,
            url = %request.url,
            stream = options.stream,
            "sending upstream request"
        );

        let mut req_builder = self.client.post(&request.url).json(&request.body);
        for (key, value) in &request.headers {
            req_builder = req_builder.header(key, value);
        }
        req_builder = req_builder.header("x-request-id", request_id.to_string());
        if let Some(timeout) = options.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            let error = map_transport_error(&e);
            warn!(
                request_id = %request_id,
                provider = %options.provider,
                error = %error,
                "upstream request failed"
            );
            error
        })?;

        let status = response.status();
        debug!(request_id = %request_id, status = status.as_u16(), "upstream response status");

        if !status.is_success() {
            let body = response.text().await.ok();
            warn!(
                request_id = %request_id,
                provider = %options.provider,
                status = status.as_u16(),
                "upstream returned error status"
            );
            return Err(map_http_error(
                status.as_u16(),
                body,
                &options.provider,
                &options.model,
            ));
        }

        let headers = collect_headers(&response);

        if options.stream {
            let stream = response
                .bytes_stream()
                .map_err(|e| map_transport_error(&e));
            return Ok(TransportResponse {
                status: status.as_u16(),
                headers,
                body: TransportBody::Stream(Box::pin(stream)),
            });
        }

        self.check_content_length(&response, options)?;

        let bytes = response.bytes().await.map_err(|e| map_transport_error(&e))?;
        if bytes.len() > self.max_response_size {
            return Err(self.too_large(bytes.len(), options));
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            headers,
            body: TransportBody::Buffered(bytes),
        })
    }
}
