//! Managed-cloud (Vertex) multiplexer
//!
//! One endpoint serves two model families. Gemini-family models use the
//! generative-content shape under `publishers/google`; anthropic-family models use
//! the messages shape under `publishers/anthropic` with `anthropic_version` in the
//! body instead of a header. The family is chosen per model from the `families`
//! option, falling back to a `claude` name prefix.

use super::anthropic::{check_messages_response, is_ping};
use super::gemini::{from_gemini_response, gemini_stream_chunk, to_gemini_body};
use super::{canonical_request, StageError, StageResult, StreamChunk, StreamState, TransformContext, Transformer};
use crate::http::OutboundRequest;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
const FAMILY_KEY: &str = "vertex_family";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gemini,
    Anthropic,
}

impl ModelFamily {
    fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Gemini => "gemini",
            ModelFamily::Anthropic => "anthropic",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "gemini" | "google" => Some(ModelFamily::Gemini),
            "anthropic" | "claude" => Some(ModelFamily::Anthropic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexStage {
    families: HashMap<String, ModelFamily>,
}

impl VertexStage {
    /// Options: `families: {model: "gemini" | "anthropic"}`
    pub fn from_options(options: &Map<String, Value>) -> StageResult<Self> {
        let mut families = HashMap::new();
        if let Some(value) = options.get("families") {
            let map = value
                .as_object()
                .ok_or_else(|| StageError::new("option 'families' must be a map"))?;
            for (model, family) in map {
                let family = family
                    .as_str()
                    .and_then(ModelFamily::parse)
                    .ok_or_else(|| {
                        StageError::new(format!("unknown model family for '{}'", model))
                    })?;
                families.insert(model.clone(), family);
            }
        }
        Ok(Self { families })
    }

    pub fn family_of(&self, model: &str) -> ModelFamily {
        self.families.get(model).copied().unwrap_or_else(|| {
            if model.starts_with("claude") {
                ModelFamily::Anthropic
            } else {
                ModelFamily::Gemini
            }
        })
    }

    fn recorded_family(&self, ctx: &TransformContext) -> ModelFamily {
        ctx.metadata
            .get(FAMILY_KEY)
            .and_then(Value::as_str)
            .and_then(ModelFamily::parse)
            .unwrap_or_else(|| self.family_of(&ctx.model))
    }
}

fn vertex_endpoint(base: &str, family: ModelFamily, model: &str, stream: bool) -> String {
    let base = base.trim_end_matches('/');
    let (publisher, method) = match (family, stream) {
        (ModelFamily::Gemini, false) => ("google", "generateContent"),
        (ModelFamily::Gemini, true) => ("google", "streamGenerateContent?alt=sse"),
        (ModelFamily::Anthropic, false) => ("anthropic", "rawPredict"),
        (ModelFamily::Anthropic, true) => ("anthropic", "streamRawPredict"),
    };
    format!("{}/publishers/{}/models/{}:{}", base, publisher, model, method)
}

impl Transformer for VertexStage {
    fn name(&self) -> &'static str {
        "vertex"
    }

    fn transform_request(
        &self,
        mut request: OutboundRequest,
        ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        let family = self.family_of(&ctx.model);
        ctx.metadata.insert(FAMILY_KEY.into(), json!(family.as_str()));

        let canonical = canonical_request(request.body)?;
        request.body = match family {
            ModelFamily::Gemini => to_gemini_body(&canonical),
            ModelFamily::Anthropic => {
                let mut body = serde_json::to_value(&canonical)?;
                if let Some(map) = body.as_object_mut() {
                    map.remove("model");
                    map.insert("anthropic_version".into(), json!(VERTEX_ANTHROPIC_VERSION));
                }
                body
            }
        };
        request.url = vertex_endpoint(&request.url, family, &ctx.model, ctx.stream);
        Ok(request)
    }

    fn transform_response(&self, body: Value, ctx: &TransformContext) -> StageResult<Value> {
        match self.recorded_family(ctx) {
            ModelFamily::Gemini => Ok(serde_json::to_value(from_gemini_response(body, &ctx.model)?)?),
            ModelFamily::Anthropic => {
                check_messages_response(&body)?;
                Ok(body)
            }
        }
    }

    fn transform_stream_chunk(
        &self,
        chunk: StreamChunk,
        ctx: &TransformContext,
        state: &mut StreamState,
    ) -> StageResult<Vec<StreamChunk>> {
        match self.recorded_family(ctx) {
            ModelFamily::Gemini => gemini_stream_chunk(chunk, ctx, state),
            ModelFamily::Anthropic if is_ping(&chunk) => Ok(Vec::new()),
            ModelFamily::Anthropic => Ok(vec![chunk]),
        }
    }
}
