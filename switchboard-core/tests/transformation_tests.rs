//! Integration tests for transformer chains

use serde_json::{json, Map, Value};
use switchboard_core::config::{ChainPolicy, ProviderProfile, SecretString, StageSpec, TransformerConfig};
use switchboard_core::http::OutboundRequest;
use switchboard_core::protocol::{ContentBlock, Message, StopReason};
use switchboard_core::transform::{StageRegistry, StreamChunk, TransformContext, TransformerChain};
use switchboard_core::{ChatRequest, GatewayError};
use test_case::test_case;
use uuid::Uuid;

fn profile(stages: Vec<StageSpec>, models: &[(&str, Vec<StageSpec>)], policy: ChainPolicy) -> ProviderProfile {
    ProviderProfile {
        name: "p".into(),
        base_url: "https://upstream.example.com/v1".into(),
        api_keys: vec![SecretString::new("sk-test")],
        models: vec!["claude-sonnet-4".into(), "gemini-2.5-pro".into()],
        transformer: TransformerConfig {
            stages,
            models: models
                .iter()
                .map(|(model, stages)| (model.to_string(), stages.clone()))
                .collect(),
            model_policy: policy,
        },
    }
}

fn name(stage: &str) -> StageSpec {
    StageSpec::Name(stage.into())
}

fn with_options(stage: &str, options: Value) -> StageSpec {
    let options: Map<String, Value> = options.as_object().cloned().unwrap_or_default();
    StageSpec::WithOptions(stage.into(), options)
}

fn outbound(request: &ChatRequest) -> OutboundRequest {
    let mut outbound = OutboundRequest::new("https://upstream.example.com/v1", serde_json::to_value(request).unwrap());
    outbound.set_header("authorization", "Bearer sk-test");
    outbound
}

#[test_case(ChainPolicy::Append, &["cleancache", "maxtoken"] ; "append")]
#[test_case(ChainPolicy::Replace, &["maxtoken"] ; "replace")]
fn test_chain_composition(policy: ChainPolicy, expected: &[&str]) {
    let profile = profile(
        vec![name("cleancache")],
        &[("gemini-2.5-pro", vec![with_options("maxtoken", json!({"max_tokens": 1024}))])],
        policy,
    );
    let chain = TransformerChain::build(&StageRegistry::with_builtins(), &profile, "gemini-2.5-pro").unwrap();
    assert_eq!(chain.names(), expected);
}

#[test]
fn test_bad_stage_options_rejected() {
    let profile = profile(vec![with_options("maxtoken", json!({"max_tokens": "lots"}))], &[], ChainPolicy::Append);
    let err = TransformerChain::build(&StageRegistry::with_builtins(), &profile, "gemini-2.5-pro").unwrap_err();
    assert!(matches!(err, GatewayError::Configuration(_)));
}

#[test]
fn test_vertex_routes_claude_to_raw_predict() {
    let profile = profile(vec![name("vertex")], &[], ChainPolicy::Append);
    let chain = TransformerChain::build(&StageRegistry::with_builtins(), &profile, "claude-sonnet-4").unwrap();
    let mut ctx = TransformContext::new(Uuid::new_v4(), "p", "claude-sonnet-4", false);

    let request = ChatRequest::new("claude-sonnet-4", vec![Message::user("hi")]).with_max_tokens(100);
    let sent = chain.apply_request(outbound(&request), &mut ctx).unwrap();
    assert_eq!(
        sent.url,
        "https://upstream.example.com/v1/publishers/anthropic/models/claude-sonnet-4:rawPredict"
    );
    assert_eq!(sent.body["anthropic_version"], "vertex-2023-10-16");
    assert!(sent.body.get("model").is_none());

    let response = chain
        .apply_response(
            json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }),
            &ctx,
        )
        .unwrap();
    assert_eq!(response.text(), "hello");
}

#[test]
fn test_vertex_gemini_shape_mismatch_names_stage() {
    let profile = profile(vec![name("vertex")], &[], ChainPolicy::Append);
    let chain = TransformerChain::build(&StageRegistry::with_builtins(), &profile, "gemini-2.5-pro").unwrap();
    let mut ctx = TransformContext::new(Uuid::new_v4(), "p", "gemini-2.5-pro", false);
    chain
        .apply_request(outbound(&ChatRequest::new("gemini-2.5-pro", vec![Message::user("hi")])), &mut ctx)
        .unwrap();

    let err = chain.apply_response(json!({"unexpected": true}), &ctx).unwrap_err();
    match err {
        GatewayError::Transform { stage, .. } => assert_eq!(stage, "vertex"),
        other => panic!("expected transform error, got {:?}", other),
    }
}

#[test]
fn test_openai_tool_arguments_repaired() {
    let profile = profile(vec![name("openai"), name("enhancetool")], &[], ChainPolicy::Append);
    let chain = TransformerChain::build(&StageRegistry::with_builtins(), &profile, "gemini-2.5-pro").unwrap();
    let ctx = TransformContext::new(Uuid::new_v4(), "p", "gemini-2.5-pro", false);

    let raw = json!({
        "id": "chatcmpl-1",
        "model": "gemini-2.5-pro",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "read_file", "arguments": "{\"path\": \"src/lib.rs\",}"}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5}
    });

    let response = chain.apply_response(raw, &ctx).unwrap();
    assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    match &response.content[0] {
        ContentBlock::ToolUse { name, input, .. } => {
            assert_eq!(name, "read_file");
            assert_eq!(input, &json!({"path": "src/lib.rs"}));
        }
        other => panic!("expected tool use, got {:?}", other),
    }
}

#[test]
fn test_anthropic_stream_drops_ping() {
    let profile = profile(vec![name("anthropic")], &[], ChainPolicy::Append);
    let chain = TransformerChain::build(&StageRegistry::with_builtins(), &profile, "claude-sonnet-4").unwrap();
    let ctx = TransformContext::new(Uuid::new_v4(), "p", "claude-sonnet-4", true);
    let mut states = chain.new_stream_states();

    let ping = StreamChunk::Event {
        event: Some("ping".into()),
        data: json!({"type": "ping"}),
    };
    assert!(chain.apply_stream_chunk(ping, &ctx, &mut states).unwrap().is_empty());

    let stop = StreamChunk::data(json!({"type": "message_stop"}));
    assert_eq!(chain.apply_stream_chunk(stop, &ctx, &mut states).unwrap().len(), 1);
}

#[test_case(vec![] ; "identity chain")]
#[test_case(vec![name("anthropic")] ; "anthropic stage")]
fn test_web_search_response_decodes(stages: Vec<StageSpec>) {
    let profile = profile(stages, &[], ChainPolicy::Append);
    let chain = TransformerChain::build(&StageRegistry::with_builtins(), &profile, "claude-sonnet-4").unwrap();
    let ctx = TransformContext::new(Uuid::new_v4(), "p", "claude-sonnet-4", false);

    let raw = json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "claude-sonnet-4",
        "content": [
            {"type": "server_tool_use", "id": "srv_1", "name": "web_search", "input": {"query": "rust 2024 edition"}},
            {"type": "web_search_tool_result", "tool_use_id": "srv_1", "content": [
                {"type": "web_search_result", "url": "https://blog.rust-lang.org", "title": "Rust Blog"}
            ]},
            {"type": "text", "text": "The 2024 edition shipped with Rust 1.85."},
            {"type": "container_upload", "file_id": "f1"}
        ],
        "stop_reason": "pause_turn",
        "usage": {"input_tokens": 12, "output_tokens": 30}
    });

    let response = chain.apply_response(raw, &ctx).unwrap();
    assert_eq!(response.content.len(), 4);
    assert!(matches!(&response.content[0], ContentBlock::ServerToolUse { name, .. } if name == "web_search"));
    assert!(matches!(&response.content[1], ContentBlock::WebSearchToolResult { tool_use_id, .. } if tool_use_id == "srv_1"));
    assert!(matches!(&response.content[3], ContentBlock::Other(value) if value["type"] == "container_upload"));
    assert_eq!(response.stop_reason, Some(StopReason::PauseTurn));
}

#[test]
fn test_unknown_stop_reason_tolerated() {
    let chain = TransformerChain::default();
    let ctx = TransformContext::new(Uuid::new_v4(), "p", "claude-sonnet-4", false);
    let raw = json!({
        "id": "msg_2",
        "content": [{"type": "text", "text": "ok"}],
        "stop_reason": "model_context_window_exceeded"
    });
    let response = chain.apply_response(raw, &ctx).unwrap();
    assert_eq!(response.stop_reason, Some(StopReason::Other));
}
