//! Request dispatch
//!
//! [`Gateway`] is the entry point callers use: it routes a canonical request,
//! folds it through the destination's transformer chain, sends it with the
//! resilience ledger guarding every attempt, and folds the answer (buffered or
//! streamed) back into canonical form.

use crate::attachment::{parse_image_id, AttachmentCache, AttachmentPayload};
use crate::config::{ConfigValidator, GatewayConfig, ProviderProfile};
use crate::error::{GatewayError, GatewayResult};
use crate::http::{
    ByteStream, HttpClient, OutboundRequest, RequestOptions, Transport, TransportBody,
    TransportResponse,
};
use crate::protocol::{ChatRequest, ChatResponse, ErrorResponse};
use crate::resilience::{retry_with_backoff, FailureDisposition, ResilienceLedger};
use crate::router::{CustomRouter, RouteDecision, Router};
use crate::stream::{pump, EventStream};
use crate::transform::{StageRegistry, TransformContext, TransformerChain};
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Canonical answer to a request
pub enum GatewayResponse {
    Complete(ChatResponse),
    Stream(EventStream),
}

impl fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayResponse::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            GatewayResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    config: GatewayConfig,
    transport: Option<Arc<dyn Transport>>,
    custom_router: Option<Arc<dyn CustomRouter>>,
    cache: Option<Arc<AttachmentCache>>,
    registry: StageRegistry,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            transport: None,
            custom_router: None,
            cache: None,
            registry: StageRegistry::with_builtins(),
        }
    }

    /// Send upstream calls through `transport` instead of the default HTTP client
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn custom_router(mut self, router: Arc<dyn CustomRouter>) -> Self {
        self.custom_router = Some(router);
        self
    }

    /// Share an attachment cache with other components
    pub fn attachment_cache(mut self, cache: Arc<AttachmentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> GatewayResult<Gateway> {
        ConfigValidator::with_registry(&self.registry)
            .validate(&self.config)
            .map_err(|e| GatewayError::configuration(e.to_string()))?;

        let mut chains = HashMap::new();
        for profile in &self.config.providers {
            for model in &profile.models {
                let chain = TransformerChain::build(&self.registry, profile, model)?;
                debug!(provider = %profile.name, model = %model, stages = ?chain.names(), "built transformer chain");
                chains.insert((profile.name.clone(), model.clone()), chain);
            }
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpClient::with_config(&self.config.connection)?),
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(AttachmentCache::new(self.config.attachments.clone())));
        let ledger = ResilienceLedger::new(self.config.resilience.clone(), &self.config.providers);

        let config = Arc::new(self.config);
        let mut router = Router::new(Arc::clone(&config), Arc::clone(&cache))?;
        if let Some(custom) = self.custom_router {
            router = router.with_custom_router(custom);
        }

        info!(providers = config.providers.len(), chains = chains.len(), "gateway ready");
        Ok(Gateway {
            config,
            router,
            ledger,
            transport,
            chains,
            cache,
        })
    }
}

/// Everything one upstream attempt needs
struct Call<'a> {
    request_id: Uuid,
    decision: &'a RouteDecision,
    profile: &'a ProviderProfile,
    chain: &'a TransformerChain,
    body: &'a Value,
    stream: bool,
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    router: Router,
    ledger: ResilienceLedger,
    transport: Arc<dyn Transport>,
    chains: HashMap<(String, String), TransformerChain>,
    cache: Arc<AttachmentCache>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ResilienceLedger {
        &self.ledger
    }

    pub fn attachment_cache(&self) -> &Arc<AttachmentCache> {
        &self.cache
    }

    /// Serve one canonical request
    pub async fn handle(&self, request: ChatRequest) -> GatewayResult<GatewayResponse> {
        let request_id = Uuid::new_v4();
        let mut request = request;

        let decision = self.router.resolve(&mut request, request_id).await?;
        info!(
            request_id = %request_id,
            provider = %decision.provider,
            model = %decision.model,
            reason = %decision.reason,
            stream = request.stream,
            "dispatching request"
        );

        let profile = self.config.provider(&decision.provider).ok_or_else(|| {
            GatewayError::configuration(format!("Unknown provider '{}'", decision.provider))
        })?;
        let chain = self
            .chains
            .get(&(decision.provider.clone(), decision.model.clone()))
            .ok_or_else(|| {
                GatewayError::configuration(format!(
                    "no transformer chain for {},{}",
                    decision.provider, decision.model
                ))
            })?;
        let body = serde_json::to_value(&request)?;

        let call = Call {
            request_id,
            decision: &decision,
            profile,
            chain,
            body: &body,
            stream: request.stream,
        };
        let call = &call;

        let result = retry_with_backoff(self.ledger.retry_policy(), move |attempt| {
            self.attempt(call, attempt)
        })
        .await;

        let (response, ctx) = match result {
            Ok(ok) => ok,
            Err(e) => {
                error!(
                    request_id = %request_id,
                    provider = %decision.provider,
                    error = %e,
                    "request failed"
                );
                return Err(e);
            }
        };

        if call.stream {
            let body = match response.body {
                TransportBody::Stream(body) => body,
                TransportBody::Buffered(bytes) => single_chunk(bytes),
            };
            return Ok(GatewayResponse::Stream(pump(body, chain.clone(), ctx)));
        }

        let bytes = match response.body {
            TransportBody::Buffered(bytes) => bytes,
            TransportBody::Stream(body) => collect_body(body).await?,
        };
        let raw: Value = serde_json::from_slice(&bytes).map_err(|e| {
            GatewayError::transform(
                chain.names().last().copied().unwrap_or("canonical"),
                format!("upstream response is not JSON: {}", e),
            )
        })?;
        let response = chain.apply_response(raw, &ctx)?;
        debug!(
            request_id = %request_id,
            provider = %decision.provider,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "request completed"
        );
        Ok(GatewayResponse::Complete(response))
    }

    /// One attempt, rotating keys until the provider answers or runs out of keys
    async fn attempt(
        &self,
        call: &Call<'_>,
        attempt: u32,
    ) -> GatewayResult<(TransportResponse, TransformContext)> {
        let provider = &call.decision.provider;
        loop {
            let lease = self.ledger.acquire(provider)?;

            let mut ctx = TransformContext::new(
                call.request_id,
                provider.as_str(),
                call.decision.model.as_str(),
                call.stream,
            );
            let mut outbound = OutboundRequest::new(call.profile.base_url.clone(), call.body.clone());
            outbound.set_header("authorization", format!("Bearer {}", lease.key.expose_secret()));
            outbound.set_header("content-type", "application/json");
            let outbound = call.chain.apply_request(outbound, &mut ctx)?;

            debug!(
                request_id = %call.request_id,
                provider = %provider,
                attempt,
                key_index = lease.key_index,
                url = %outbound.url,
                "upstream attempt"
            );

            let options = RequestOptions::new(call.request_id, provider.as_str(), call.decision.model.as_str())
                .streaming(call.stream);
            match self.transport.send(outbound, &options).await {
                Ok(response) => {
                    self.ledger.record_success(&lease);
                    return Ok((response, ctx));
                }
                Err(e) => match self.ledger.record_failure(&lease, &e) {
                    FailureDisposition::Rotated => {
                        warn!(
                            request_id = %call.request_id,
                            provider = %provider,
                            key_index = lease.key_index,
                            "retrying with next API key"
                        );
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    /// Like [`Gateway::handle`], but every failure becomes a canonical error
    /// body paired with the HTTP status to answer with
    pub async fn handle_canonical(&self, request: ChatRequest) -> (u16, Result<GatewayResponse, ErrorResponse>) {
        match self.handle(request).await {
            Ok(response) => (200, Ok(response)),
            Err(e) => (e.status_code(), Err(e.to_error_response())),
        }
    }

    /// Like [`Gateway::handle`], abandoning the request when `token` fires.
    ///
    /// A returned stream also ends as soon as the token is cancelled.
    pub async fn handle_with_cancellation(
        &self,
        request: ChatRequest,
        token: CancellationToken,
    ) -> GatewayResult<GatewayResponse> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("request cancelled by caller");
                Err(GatewayError::Cancelled)
            }
            result = self.handle(request) => match result? {
                GatewayResponse::Stream(events) => Ok(GatewayResponse::Stream(Box::pin(
                    events.take_until(token.clone().cancelled_owned()),
                ))),
                complete => Ok(complete),
            }
        }
    }

    /// Resolve the `{request_id}#{n}` id handed out in an `[Image #n]` marker
    pub fn lookup_attachment(&self, image_id: &str) -> Option<AttachmentPayload> {
        match parse_image_id(image_id)? {
            (Some(request_id), n) => self.cache.lookup(request_id, n),
            (None, _) => {
                debug!(image_id, "attachment id has no request scope");
                None
            }
        }
    }

    /// Resolve an image id on behalf of `request_id`; bare `#n` and `n` refer to that request
    pub fn lookup_attachment_in(&self, request_id: &str, image_id: &str) -> Option<AttachmentPayload> {
        let (scope, n) = parse_image_id(image_id)?;
        self.cache.lookup(scope.unwrap_or(request_id), n)
    }
}

fn single_chunk(bytes: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(bytes) }))
}

async fn collect_body(mut body: ByteStream) -> GatewayResult<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
