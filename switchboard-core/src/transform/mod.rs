//! Transformer pipeline
//!
//! A provider's traffic passes through an ordered chain of stages. Requests fold
//! through the chain front to back starting from the canonical body; responses
//! and stream chunks fold back to front until they are canonical again.
//!
//! Stages are a closed set ([`Stage`]) looked up by name in a
//! [`StageRegistry`], so unknown names are rejected when configuration loads.

pub mod anthropic;
pub mod chain;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod stream_state;
pub mod utility;
pub mod vertex;

pub use chain::TransformerChain;
pub use registry::StageRegistry;
pub use stream_state::StreamState;

use crate::error::GatewayError;
use crate::http::OutboundRequest;
use crate::protocol::{ChatRequest, StreamEvent};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Failure inside a single stage; the chain attributes it to the stage name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StageError(pub String);

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub(crate) fn into_gateway(self, stage: &str) -> GatewayError {
        GatewayError::transform(stage, self.0)
    }
}

impl From<serde_json::Error> for StageError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Per-request data shared by the stages of a chain
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub request_id: Uuid,
    pub provider: String,
    /// Upstream model name
    pub model: String,
    pub stream: bool,
    /// Notes left by request stages for the response phase
    pub metadata: Map<String, Value>,
}

impl TransformContext {
    pub fn new(request_id: Uuid, provider: impl Into<String>, model: impl Into<String>, stream: bool) -> Self {
        Self {
            request_id,
            provider: provider.into(),
            model: model.into(),
            stream,
            metadata: Map::new(),
        }
    }
}

/// One decoded server-sent event travelling through the chain
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Event { event: Option<String>, data: Value },
    /// End of the upstream stream (`[DONE]` or transport closure)
    Done,
}

impl StreamChunk {
    pub fn data(data: Value) -> Self {
        StreamChunk::Event { event: None, data }
    }

    /// Chunk carrying a canonical event
    pub fn canonical(event: &StreamEvent) -> Self {
        StreamChunk::Event {
            event: Some(event.event_name().to_string()),
            data: serde_json::to_value(event).unwrap_or_default(),
        }
    }

    /// `type` field of the payload, if any
    pub fn kind(&self) -> Option<&str> {
        match self {
            StreamChunk::Event { data, .. } => data.get("type").and_then(Value::as_str),
            StreamChunk::Done => None,
        }
    }
}

/// A pipeline stage. Every capability defaults to identity.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn transform_request(
        &self,
        request: OutboundRequest,
        _ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        Ok(request)
    }

    fn transform_response(&self, body: Value, _ctx: &TransformContext) -> StageResult<Value> {
        Ok(body)
    }

    fn transform_stream_chunk(
        &self,
        chunk: StreamChunk,
        _ctx: &TransformContext,
        _state: &mut StreamState,
    ) -> StageResult<Vec<StreamChunk>> {
        Ok(vec![chunk])
    }
}

/// Every stage the gateway knows about
#[derive(Debug, Clone)]
pub enum Stage {
    OpenAi(openai::OpenAiStage),
    Anthropic(anthropic::AnthropicStage),
    Gemini(gemini::GeminiStage),
    Vertex(vertex::VertexStage),
    MaxToken(utility::MaxTokenStage),
    CleanCache(utility::CleanCacheStage),
    EnhanceTool(utility::EnhanceToolStage),
}

impl Stage {
    fn inner(&self) -> &dyn Transformer {
        match self {
            Stage::OpenAi(s) => s,
            Stage::Anthropic(s) => s,
            Stage::Gemini(s) => s,
            Stage::Vertex(s) => s,
            Stage::MaxToken(s) => s,
            Stage::CleanCache(s) => s,
            Stage::EnhanceTool(s) => s,
        }
    }
}

impl Transformer for Stage {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn transform_request(
        &self,
        request: OutboundRequest,
        ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        self.inner().transform_request(request, ctx)
    }

    fn transform_response(&self, body: Value, ctx: &TransformContext) -> StageResult<Value> {
        self.inner().transform_response(body, ctx)
    }

    fn transform_stream_chunk(
        &self,
        chunk: StreamChunk,
        ctx: &TransformContext,
        state: &mut StreamState,
    ) -> StageResult<Vec<StreamChunk>> {
        self.inner().transform_stream_chunk(chunk, ctx, state)
    }
}

/// Decode a body that must still be canonical
pub(crate) fn canonical_request(body: Value) -> StageResult<ChatRequest> {
    serde_json::from_value(body)
        .map_err(|e| StageError::new(format!("expected a canonical request body: {}", e)))
}

/// Remove the default `Authorization: Bearer` header, returning the key
pub(crate) fn take_bearer(request: &mut OutboundRequest) -> Option<String> {
    request.remove_header("authorization").map(|value| {
        value
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .unwrap_or(value)
    })
}

/// Read a non-negative integer option
pub(crate) fn option_u64(options: &Map<String, Value>, key: &str) -> StageResult<Option<u64>> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| StageError::new(format!("option '{}' must be a non-negative integer", key))),
    }
}

/// Read a string option
pub(crate) fn option_str(options: &Map<String, Value>, key: &str) -> StageResult<Option<String>> {
    match options.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(StageError::new(format!("option '{}' must be a string", key))),
    }
}
