//! Anthropic messages stage
//!
//! The canonical shape is the messages shape, so this stage only adjusts
//! transport details: `x-api-key` auth, the `anthropic-version` header and a
//! default `max_tokens`. Keep-alive `ping` events are dropped from streams.

use super::{option_str, option_u64, take_bearer, StageError, StageResult, StreamChunk, StreamState, TransformContext, Transformer};
use crate::http::OutboundRequest;
use serde_json::{json, Map, Value};

const DEFAULT_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicStage {
    version: String,
    default_max_tokens: u64,
}

impl Default for AnthropicStage {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl AnthropicStage {
    /// Options: `version`, `max_tokens`
    pub fn from_options(options: &Map<String, Value>) -> StageResult<Self> {
        let mut stage = Self::default();
        if let Some(version) = option_str(options, "version")? {
            stage.version = version;
        }
        if let Some(max_tokens) = option_u64(options, "max_tokens")? {
            stage.default_max_tokens = max_tokens;
        }
        Ok(stage)
    }
}

/// Whether a stream chunk is a keep-alive
pub(crate) fn is_ping(chunk: &StreamChunk) -> bool {
    chunk.kind() == Some("ping")
}

/// Minimal check that a body is a messages response
pub(crate) fn check_messages_response(body: &Value) -> StageResult<()> {
    if body.get("content").is_some_and(Value::is_array) {
        Ok(())
    } else {
        Err(StageError::new("expected a messages response with a content array"))
    }
}

impl Transformer for AnthropicStage {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn transform_request(
        &self,
        mut request: OutboundRequest,
        _ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        let body = request
            .body
            .as_object_mut()
            .filter(|b| b.get("messages").is_some_and(Value::is_array))
            .ok_or_else(|| StageError::new("expected a canonical request body"))?;

        if !body.contains_key("max_tokens") {
            body.insert("max_tokens".into(), json!(self.default_max_tokens));
        }

        if let Some(key) = take_bearer(&mut request) {
            request.set_header("x-api-key", key);
        }
        request.set_header("anthropic-version", self.version.clone());
        Ok(request)
    }

    fn transform_response(&self, body: Value, _ctx: &TransformContext) -> StageResult<Value> {
        check_messages_response(&body)?;
        Ok(body)
    }

    fn transform_stream_chunk(
        &self,
        chunk: StreamChunk,
        _ctx: &TransformContext,
        _state: &mut StreamState,
    ) -> StageResult<Vec<StreamChunk>> {
        if is_ping(&chunk) {
            return Ok(Vec::new());
        }
        Ok(vec![chunk])
    }
}
