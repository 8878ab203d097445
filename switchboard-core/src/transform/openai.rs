//! OpenAI chat/completions stage
//!
//! Request: canonical messages → `messages`/`tools`/`tool_choice` of the
//! chat/completions API. Response: `choices[0].message` → canonical content
//! blocks. Stream: delta chunks → canonical events, `[DONE]` closes the message.

use super::{canonical_request, StageError, StageResult, StreamChunk, StreamState, TransformContext, Transformer};
use crate::http::OutboundRequest;
use crate::protocol::{
    ChatRequest, ChatResponse, ContentBlock, ErrorBody, ImageSource, Message, MessageContent,
    Role, StopReason, StreamEvent, ToolResultContent, Usage,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default)]
pub struct OpenAiStage;

impl Transformer for OpenAiStage {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn transform_request(
        &self,
        mut request: OutboundRequest,
        _ctx: &mut TransformContext,
    ) -> StageResult<OutboundRequest> {
        let canonical = canonical_request(request.body)?;
        request.body = to_openai_request(&canonical);
        Ok(request)
    }

    fn transform_response(&self, body: Value, _ctx: &TransformContext) -> StageResult<Value> {
        let response: OpenAiResponse = serde_json::from_value(body)
            .map_err(|e| StageError::new(format!("unexpected chat/completions response: {}", e)))?;
        Ok(serde_json::to_value(from_openai_response(response)?)?)
    }

    fn transform_stream_chunk(
        &self,
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

        if let Some(error) = data.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream stream error")
                .to_string();
            return Ok(vec![StreamChunk::canonical(&StreamEvent::Error {
                error: ErrorBody {
                    kind: "api_error".to_string(),
                    message,
                },
            })]);
        }

        let chunk: OpenAiStreamChunk = serde_json::from_value(data)
            .map_err(|e| StageError::new(format!("unexpected chat/completions chunk: {}", e)))?;

        let mut out = state.start_message(
            chunk.id.as_deref().unwrap_or("msg_stream"),
            chunk.model.as_deref().unwrap_or(&ctx.model),
        );

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
                out.extend(state.thinking_delta(reasoning));
            }
            if let Some(content) = choice.delta.content.as_deref() {
                out.extend(state.text_delta(content));
            }
            for (position, call) in choice.delta.tool_calls.into_iter().flatten().enumerate() {
                let key = call.index.unwrap_or(position);
                let function = call.function.unwrap_or_default();
                if !state.has_tool(key) {
                    let id = call.id.unwrap_or_else(|| format!("call_{}", key));
                    out.extend(state.start_tool(key, &id, function.name.as_deref().unwrap_or("")));
                }
                if let Some(arguments) = function.arguments.as_deref() {
                    out.extend(state.tool_args_delta(key, arguments));
                }
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                state.set_stop_reason(map_finish_reason(reason));
            }
        }

        if let Some(usage) = chunk.usage {
            state.set_usage(usage.into());
        }

        Ok(out)
    }
}

/// Convert a canonical request to the chat/completions shape
pub fn to_openai_request(request: &ChatRequest) -> Value {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system.text()}));
    }

    for message in &request.messages {
        match message.role {
            Role::User => push_user_message(&mut messages, message),
            Role::Assistant => messages.push(assistant_message(message)),
        }
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), Value::Array(messages));
    if let Some(max_tokens) = request.max_tokens {
        body.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".into(), json!(top_p));
    }
    if let Some(stop) = &request.stop_sequences {
        body.insert("stop".into(), json!(stop));
    }
    if request.stream {
        body.insert("stream".into(), json!(true));
        body.insert("stream_options".into(), json!({"include_usage": true}));
    }
    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "parameters": tool.input_schema.clone()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }
                })
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
    }
    if let Some(choice) = request.tool_choice.as_ref().and_then(to_openai_tool_choice) {
        body.insert("tool_choice".into(), choice);
    }

    Value::Object(body)
}

fn push_user_message(messages: &mut Vec<Value>, message: &Message) {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            messages.push(json!({"role": "user", "content": text}));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": tool_result_text(content.as_ref()),
                }));
            }
            ContentBlock::Text { text, .. } => parts.push(json!({"type": "text", "text": text})),
            ContentBlock::Image { source } => parts.push(json!({
                "type": "image_url",
                "image_url": {"url": image_url(source)},
            })),
            _ => {}
        }
    }

    if !parts.is_empty() {
        messages.push(json!({"role": "user", "content": parts}));
    }
}

fn assistant_message(message: &Message) -> Value {
    let blocks = match &message.content {
        MessageContent::Text(text) => return json!({"role": "assistant", "content": text}),
        MessageContent::Blocks(blocks) => blocks,
    };

    let text: String = blocks.iter().filter_map(ContentBlock::as_text).collect();
    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": input.to_string()},
            })),
            _ => None,
        })
        .collect();

    let mut out = Map::new();
    out.insert("role".into(), json!("assistant"));
    out.insert(
        "content".into(),
        if text.is_empty() { Value::Null } else { json!(text) },
    );
    if !tool_calls.is_empty() {
        out.insert("tool_calls".into(), Value::Array(tool_calls));
    }
    Value::Object(out)
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

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{};base64,{}", media_type, data),
        ImageSource::Url { url } => url.clone(),
    }
}

fn to_openai_tool_choice(choice: &Value) -> Option<Value> {
    match choice.get("type").and_then(Value::as_str)? {
        "auto" => Some(json!("auto")),
        "any" => Some(json!("required")),
        "none" => Some(json!("none")),
        "tool" => {
            let name = choice.get("name").and_then(Value::as_str)?;
            Some(json!({"type": "function", "function": {"name": name}}))
        }
        _ => None,
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::Refusal,
        _ => StopReason::EndTurn,
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptDetails>,
}

#[derive(Debug, Deserialize)]
struct OpenAiPromptDetails {
    #[serde(default)]
    cached_tokens: Option<u32>,
}

impl From<OpenAiUsage> for Usage {
    fn from(usage: OpenAiUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

fn from_openai_response(response: OpenAiResponse) -> StageResult<ChatResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| StageError::new("chat/completions response has no choices"))?;

    let mut content = Vec::new();
    if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
        content.push(ContentBlock::Thinking {
            thinking: reasoning,
            signature: None,
        });
    }
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(ContentBlock::text(text));
    }
    for (position, call) in choice.message.tool_calls.into_iter().flatten().enumerate() {
        let function = call.function.unwrap_or_default();
        let arguments = function.arguments.unwrap_or_default();
        // Unparseable arguments stay a string for the enhancetool stage
        let input = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&arguments).unwrap_or(Value::String(arguments))
        };
        content.push(ContentBlock::ToolUse {
            id: call.id.unwrap_or_else(|| format!("call_{}", call.index.unwrap_or(position))),
            name: function.name.unwrap_or_default(),
            input,
        });
    }

    Ok(ChatResponse {
        id: response.id.unwrap_or_else(|| "msg_openai".to_string()),
        kind: "message".to_string(),
        role: Role::Assistant,
        model: response.model.unwrap_or_default(),
        content,
        stop_reason: Some(map_finish_reason(choice.finish_reason.as_deref().unwrap_or("stop"))),
        stop_sequence: None,
        usage: response.usage.map(Usage::from).unwrap_or_default(),
    })
}
