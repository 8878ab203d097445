//! Integration tests for route resolution

use proptest::prelude::*;
use std::sync::Arc;
use switchboard_core::attachment::{AttachmentCache, AttachmentCacheConfig};
use switchboard_core::config::{ProviderProfile, RoutingRules, SecretString};
use switchboard_core::protocol::{ContentBlock, ImageSource, Message, ToolResultContent};
use switchboard_core::router::estimate_request_tokens;
use switchboard_core::{ChatRequest, GatewayConfig, RouteReason, Router};
use uuid::Uuid;

fn config(rules: RoutingRules) -> Arc<GatewayConfig> {
    let provider = |name: &str, models: &[&str]| ProviderProfile {
        name: name.to_string(),
        base_url: format!("https://{}.example.com", name),
        api_keys: vec![SecretString::new("k")],
        models: models.iter().map(|m| m.to_string()).collect(),
        transformer: Default::default(),
    };
    Arc::new(GatewayConfig {
        providers: vec![
            provider("main", &["chat", "reasoner"]),
            provider("aux", &["long", "vision"]),
        ],
        router: rules,
        ..Default::default()
    })
}

fn rules() -> RoutingRules {
    RoutingRules {
        default: Some("main,chat".into()),
        think: Some("main,reasoner".into()),
        long_context: Some("aux,long".into()),
        image: Some("aux,vision".into()),
        ..Default::default()
    }
}

fn png() -> ContentBlock {
    ContentBlock::Image {
        source: ImageSource::Base64 {
            media_type: "image/png".into(),
            data: "iVBORw0KGgo=".into(),
        },
    }
}

#[tokio::test]
async fn test_screenshot_in_tool_result_goes_to_vision_model() {
    let cache = Arc::new(AttachmentCache::new(AttachmentCacheConfig::default()));
    let router = Router::new(config(rules()), Arc::clone(&cache)).unwrap();
    let request_id = Uuid::new_v4();

    let mut request = ChatRequest::new(
        "claude-sonnet",
        vec![
            Message::user("open the page"),
            Message::assistant("taking a screenshot"),
            Message::user_blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: Some(ToolResultContent::Blocks(vec![ContentBlock::text("done"), png()])),
                is_error: None,
            }]),
        ],
    );

    let decision = router.resolve(&mut request, request_id).await.unwrap();
    assert_eq!(decision.reason, RouteReason::Image);
    assert_eq!((decision.provider.as_str(), decision.model.as_str()), ("aux", "vision"));
    assert_eq!(request.model, "vision");

    assert!(cache.lookup(&request_id.to_string(), 1).is_some());
    assert!(cache.get("#1").is_none());
    assert_eq!(cache.len(), 1);

    let body = serde_json::to_string(&request).unwrap();
    assert_eq!(body.matches("[Image #1]").count(), 1);
    assert!(!body.contains("iVBORw0KGgo="));
}

#[tokio::test]
async fn test_thinking_request_without_think_slot_uses_default() {
    let router = Router::new(
        config(RoutingRules {
            think: None,
            ..rules()
        }),
        Arc::new(AttachmentCache::new(AttachmentCacheConfig::default())),
    )
    .unwrap();

    let mut request = ChatRequest::new("claude-opus", vec![Message::user("plan it")]).with_thinking(2048);
    let decision = router.resolve(&mut request, Uuid::new_v4()).await.unwrap();
    assert_eq!(decision.model, "chat");
}

proptest! {
    #[test]
    fn test_long_context_threshold(words in 1usize..400, threshold in 1usize..400) {
        let router = Router::new(
            config(RoutingRules { long_context_threshold: threshold, ..rules() }),
            Arc::new(AttachmentCache::new(AttachmentCacheConfig::default())),
        )
        .unwrap();

        let mut request = ChatRequest::new("claude-sonnet", vec![Message::user("token ".repeat(words))]);
        let tokens = estimate_request_tokens(&request);
        let decision = tokio_test::block_on(router.resolve(&mut request, Uuid::new_v4())).unwrap();

        prop_assert_eq!(decision.reason == RouteReason::LongContext, tokens > threshold);
    }
}
