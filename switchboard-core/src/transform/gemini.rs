//! Gemini generative-content stage
//!
//! Request: canonical messages → `contents` with `user`/`model` roles and typed
//! `parts`; the system prompt becomes a leading user turn. The endpoint is
//! `{base}/{model}:generateContent`, or `:streamGenerateContent?alt=sse` when
//! streaming. Responses and stream chunks share the candidate shape.

use super::{canonical_request, take_bearer, StageError, StageResult, StreamChunk, StreamState, TransformContext, Transformer};
use crate::http::OutboundRequest;
use crate::protocol::{
    ChatRequest, ChatResponse, ContentBlock, ImageSource, MessageContent, Role, StopReason,
    ToolResultContent, Usage,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// JSON-schema keywords the function declaration schema rejects
const UNSUPPORTED_SCHEMA_KEYS: [&str; 3] = ["$schema", "additionalProperties", "default"];

#[derive(Debug, Clone, Default)]
pub struct GeminiStage;

impl Transformer for GeminiStage {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn transform_request(
        &self,
        mut request: OutboundRequest,
        ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        let canonical = canonical_request(request.body)?;
        request.body = to_gemini_body(&canonical);
        request.url = gemini_endpoint(&request.url, &ctx.model, ctx.stream);
        if let Some(key) = take_bearer(&mut request) {
            request.set_header("x-goog-api-key", key);
        }
        Ok(request)
    }

    fn transform_response(&self, body: Value, ctx: &TransformContext) -> StageResult<Value> {
        Ok(serde_json::to_value(from_gemini_response(body, &ctx.model)?)?)
    }

    fn transform_stream_chunk(
        &self,
        chunk: StreamChunk,
        ctx: &TransformContext,
        state: &mut StreamState,
    ) -> StageResult<Vec<StreamChunk>> {
        gemini_stream_chunk(chunk, ctx, state)
    }
}

/// `{base}/{model}:generateContent` or the SSE streaming variant
pub fn gemini_endpoint(base: &str, model: &str, stream: bool) -> String {
    let base = base.trim_end_matches('/');
    if stream {
        format!("{}/{}:streamGenerateContent?alt=sse", base, model)
    } else {
        format!("{}/{}:generateContent", base, model)
    }
}

/// Convert a canonical request to a generateContent body
pub fn to_gemini_body(request: &ChatRequest) -> Value {
    let mut contents = Vec::new();

    if let Some(system) = &request.system {
        let text = system.text();
        if !text.is_empty() {
            contents.push(json!({"role": "user", "parts": [{"text": text}]}));
        }
    }

    // functionResponse parts are matched to their call by name
    let mut tool_names: HashMap<&str, &str> = HashMap::new();

    for message in &request.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
        };

        let parts: Vec<Value> = match &message.content {
            MessageContent::Text(text) => vec![json!({"text": text})],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text, .. } => Some(json!({"text": text})),
                    ContentBlock::Image { source } => Some(image_part(source)),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_names.insert(id, name);
                        Some(json!({"functionCall": {"name": name, "args": input}}))
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => Some(json!({
                        "functionResponse": {
                            "name": tool_names.get(tool_use_id.as_str()).copied().unwrap_or(tool_use_id),
                            "response": {"content": tool_result_text(content.as_ref())},
                        }
                    })),
                    _ => None,
                })
                .collect(),
        };

        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }

    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));

    let mut generation = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".into(), json!(top_p));
    }
    if let Some(stop) = &request.stop_sequences {
        generation.insert("stopSequences".into(), json!(stop));
    }
    if request.thinking_enabled() {
        let mut thinking = json!({"includeThoughts": true});
        if let Some(budget) = request.thinking.as_ref().and_then(|t| t.budget_tokens) {
            thinking["thinkingBudget"] = json!(budget);
        }
        generation.insert("thinkingConfig".into(), thinking);
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }

    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        let mut declarations = Vec::new();
        let mut gemini_tools = Vec::new();
        for tool in tools {
            if tool.is_web_search() {
                gemini_tools.push(json!({"googleSearch": {}}));
                continue;
            }
            let mut declaration = json!({
                "name": tool.name,
                "description": tool.description.clone().unwrap_or_default(),
            });
            if let Some(schema) = &tool.input_schema {
                let mut schema = schema.clone();
                strip_schema_keys(&mut schema);
                declaration["parameters"] = schema;
            }
            declarations.push(declaration);
        }
        if !declarations.is_empty() {
            gemini_tools.insert(0, json!({"functionDeclarations": declarations}));
        }
        body.insert("tools".into(), Value::Array(gemini_tools));
    }

    if let Some(config) = request.tool_choice.as_ref().and_then(tool_config) {
        body.insert("toolConfig".into(), config);
    }

    Value::Object(body)
}

fn image_part(source: &ImageSource) -> Value {
    match source {
        ImageSource::Base64 { media_type, data } => {
            json!({"inlineData": {"mimeType": media_type, "data": data}})
        }
        ImageSource::Url { url } => json!({"fileData": {"fileUri": url}}),
    }
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn tool_config(choice: &Value) -> Option<Value> {
    let mode = match choice.get("type").and_then(Value::as_str)? {
        "auto" => "AUTO",
        "any" | "tool" => "ANY",
        "none" => "NONE",
        _ => return None,
    };
    let mut config = json!({"mode": mode});
    if let Some(name) = choice.get("name").and_then(Value::as_str) {
        config["allowedFunctionNames"] = json!([name]);
    }
    Some(json!({"functionCallingConfig": config}))
}

fn strip_schema_keys(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for key in UNSUPPORTED_SCHEMA_KEYS {
                map.remove(key);
            }
            map.values_mut().for_each(strip_schema_keys);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_schema_keys),
        _ => {}
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    thought_signature: Option<String>,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    thoughts_token_count: u32,
    #[serde(default)]
    cached_content_token_count: Option<u32>,
}

impl From<GeminiUsage> for Usage {
    fn from(usage: GeminiUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count + usage.thoughts_token_count,
            cache_read_input_tokens: usage.cached_content_token_count,
        }
    }
}

fn map_finish_reason(reason: &str, has_tool_calls: bool) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => StopReason::Refusal,
        _ if has_tool_calls => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn tool_id(call: &GeminiFunctionCall) -> String {
    call.id
        .clone()
        .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()))
}

fn parse_response(body: Value) -> StageResult<GeminiResponse> {
    if body.get("candidates").is_none() && body.get("usageMetadata").is_none() {
        return Err(StageError::new("expected a generateContent response with candidates"));
    }
    serde_json::from_value(body)
        .map_err(|e| StageError::new(format!("unexpected generateContent response: {}", e)))
}

/// Convert a generateContent response to the canonical shape
pub(crate) fn from_gemini_response(body: Value, model: &str) -> StageResult<ChatResponse> {
    let response = parse_response(body)?;
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| StageError::new("generateContent response has no candidates"))?;

    let mut content = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(call) = &part.function_call {
            content.push(ContentBlock::ToolUse {
                id: tool_id(call),
                name: call.name.clone(),
                input: call.args.clone(),
            });
        } else if let Some(text) = part.text {
            if part.thought == Some(true) {
                content.push(ContentBlock::Thinking {
                    thinking: text,
                    signature: part.thought_signature,
                });
            } else {
                content.push(ContentBlock::text(text));
            }
        }
    }

    let has_tool_calls = content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));

    Ok(ChatResponse {
        id: response
            .response_id
            .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple())),
        kind: "message".to_string(),
        role: Role::Assistant,
        model: response.model_version.unwrap_or_else(|| model.to_string()),
        content,
        stop_reason: Some(map_finish_reason(
            candidate.finish_reason.as_deref().unwrap_or("STOP"),
            has_tool_calls,
        )),
        stop_sequence: None,
        usage: response.usage_metadata.map(Usage::from).unwrap_or_default(),
    })
}

/// Convert one streamed generateContent chunk to canonical events
pub(crate) fn gemini_stream_chunk(
    chunk: StreamChunk,
    ctx: &TransformContext,
    state: &mut StreamState,
) -> StageResult<Vec<StreamChunk>> {
    let data = match chunk {
        StreamChunk::Done => return Ok(state.finish()),
        StreamChunk::Event { data, .. } => data,
    };
    if state.is_finished() {
        return Ok(Vec::new());
    }

    let response = parse_response(data)?;
    let fallback_id = format!("msg_{}", ctx.request_id.simple());
    let mut out = state.start_message(
        response.response_id.as_deref().unwrap_or(&fallback_id),
        response.model_version.as_deref().unwrap_or(&ctx.model),
    );

    let mut saw_tool = false;
    for candidate in response.candidates {
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = &part.function_call {
                saw_tool = true;
                let key = state
                    .notes
                    .get("gemini_tools")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                state.notes.insert("gemini_tools".into(), json!(key + 1));
                out.extend(state.start_tool(key, &tool_id(call), &call.name));
                out.extend(state.tool_args_delta(key, &call.args.to_string()));
            } else if let Some(text) = part.text.as_deref() {
                if part.thought == Some(true) {
                    out.extend(state.thinking_delta(text));
                } else {
                    out.extend(state.text_delta(text));
                }
            }
        }
        if let Some(reason) = candidate.finish_reason.as_deref() {
            let has_tools = saw_tool || state.stop_reason() == Some(StopReason::ToolUse);
            state.set_stop_reason(map_finish_reason(reason, has_tools));
        }
    }

    if let Some(usage) = response.usage_metadata {
        state.set_usage(usage.into());
    }

    Ok(out)
}
