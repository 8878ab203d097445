//! Provider-agnostic utility stages

use super::{option_u64, StageError, StageResult, TransformContext, Transformer};
use crate::http::OutboundRequest;
use regex::Regex;
use serde_json::{json, Map, Value};

/// Caps the output token limit at `max_tokens`
#[derive(Debug, Clone)]
pub struct MaxTokenStage {
    max_tokens: u64,
}

impl MaxTokenStage {
    pub fn new(max_tokens: u64) -> Self {
        Self { max_tokens }
    }

    pub fn from_options(options: &Map<String, Value>) -> StageResult<Self> {
        let max_tokens = option_u64(options, "max_tokens")?
            .filter(|n| *n > 0)
            .ok_or_else(|| StageError::new("maxtoken requires a positive 'max_tokens' option"))?;
        Ok(Self::new(max_tokens))
    }

    fn cap(&self, slot: Option<&mut Value>) -> Option<Value> {
        match slot {
            Some(value) => {
                let capped = value.as_u64().map_or(self.max_tokens, |n| n.min(self.max_tokens));
                *value = json!(capped);
                None
            }
            None => Some(json!(self.max_tokens)),
        }
    }
}

impl Transformer for MaxTokenStage {
    fn name(&self) -> &'static str {
        "maxtoken"
    }

    fn transform_request(
        &self,
        mut request: OutboundRequest,
        _ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        let body = request
            .body
            .as_object_mut()
            .ok_or_else(|| StageError::new("request body is not an object"))?;

        if let Some(generation) = body.get_mut("generationConfig").and_then(Value::as_object_mut) {
            if let Some(value) = self.cap(generation.get_mut("maxOutputTokens")) {
                generation.insert("maxOutputTokens".into(), value);
            }
        } else if body.contains_key("max_completion_tokens") {
            self.cap(body.get_mut("max_completion_tokens"));
        } else if body.contains_key("contents") {
            body.insert("generationConfig".into(), json!({"maxOutputTokens": self.max_tokens}));
        } else if let Some(value) = self.cap(body.get_mut("max_tokens")) {
            body.insert("max_tokens".into(), value);
        }

        Ok(request)
    }
}

/// Removes `cache_control` markers anywhere in the request body
#[derive(Debug, Clone, Default)]
pub struct CleanCacheStage;

fn strip_cache_control(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("cache_control");
            map.values_mut().for_each(strip_cache_control);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_cache_control),
        _ => {}
    }
}

impl Transformer for CleanCacheStage {
    fn name(&self) -> &'static str {
        "cleancache"
    }

    fn transform_request(
        &self,
        mut request: OutboundRequest,
        _ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        strip_cache_control(&mut request.body);
        Ok(request)
    }
}

/// Repairs tool arguments that arrived as malformed or stringified JSON
#[derive(Debug, Clone)]
pub struct EnhanceToolStage {
    trailing_comma: Regex,
}

impl EnhanceToolStage {
    pub fn new() -> StageResult<Self> {
        let trailing_comma =
            Regex::new(r",\s*([}\]])").map_err(|e| StageError::new(e.to_string()))?;
        Ok(Self { trailing_comma })
    }

    /// Best-effort parse of a JSON object emitted by a model
    pub fn repair(&self, raw: &str) -> Option<Value> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Some(json!({}));
        }

        let unfenced = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|s| s.strip_suffix("```"))
            .map(str::trim)
            .unwrap_or(trimmed);

        if let Ok(value) = serde_json::from_str(unfenced) {
            return Some(value);
        }

        let without_commas = self.trailing_comma.replace_all(unfenced, "$1");
        if let Ok(value) = serde_json::from_str(&without_commas) {
            return Some(value);
        }

        let missing = without_commas.matches('{').count().saturating_sub(without_commas.matches('}').count());
        if missing > 0 {
            let closed = format!("{}{}", without_commas, "}".repeat(missing));
            if let Ok(value) = serde_json::from_str(&closed) {
                return Some(value);
            }
        }

        None
    }

    fn repair_canonical(&self, content: &mut [Value]) {
        for block in content {
            if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                continue;
            }
            let Some(input) = block.get_mut("input") else {
                continue;
            };
            if let Value::String(raw) = input {
                match self.repair(raw) {
                    Some(value) => *input = value,
                    None => tracing::warn!("leaving unparseable tool input unchanged"),
                }
            }
        }
    }

    fn repair_openai(&self, choices: &mut [Value]) {
        for call in choices
            .iter_mut()
            .filter_map(|c| c.pointer_mut("/message/tool_calls"))
            .filter_map(Value::as_array_mut)
            .flatten()
        {
            let Some(arguments) = call.pointer_mut("/function/arguments") else {
                continue;
            };
            let Some(raw) = arguments.as_str() else {
                continue;
            };
            if serde_json::from_str::<Value>(raw).is_ok() {
                continue;
            }
            if let Some(value) = self.repair(raw) {
                *arguments = Value::String(value.to_string());
            }
        }
    }
}

impl Transformer for EnhanceToolStage {
    fn name(&self) -> &'static str {
        "enhancetool"
    }

    fn transform_response(&self, mut body: Value, _ctx: &TransformContext) -> StageResult<Value> {
        if let Some(content) = body.get_mut("content").and_then(Value::as_array_mut) {
            self.repair_canonical(content);
        } else if let Some(choices) = body.get_mut("choices").and_then(Value::as_array_mut) {
            self.repair_openai(choices);
        }
        Ok(body)
    }
}
