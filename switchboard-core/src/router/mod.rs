//! Request routing
//!
//! [`Router::resolve`] picks the provider/model that serves a request. Rules are
//! checked in a fixed order and the first match wins:
//!
//! 1. the [`CustomRouter`] hook, an explicit `provider,model` in the request's
//!    `model` field, or a `<subagent-model>` directive in the system prompt
//! 2. an inline image in the latest user turn (`image`)
//! 3. extended thinking (`think`)
//! 4. a background model name (`background`)
//! 5. a prompt above the long-context threshold (`longContext`)
//! 6. a declared web-search tool (`webSearch`)
//! 7. `default`
//!
//! An empty slot falls back to `default`. Every target is checked against the
//! provider list before it is returned.

pub mod image;
pub mod tokens;

pub use image::{lookup_tool, LOOKUP_TOOL_NAME};
pub use tokens::estimate_request_tokens;

use crate::attachment::AttachmentCache;
use crate::config::{parse_route_target, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{ChatRequest, ContentBlock, SystemPrompt};
use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use uuid::Uuid;

/// User-supplied routing hook, consulted before every built-in rule
#[async_trait]
pub trait CustomRouter: Send + Sync {
    /// Return `"provider,model"` to take over the decision, or `None` to decline
    async fn route(&self, request: &ChatRequest, config: &GatewayConfig) -> Option<String>;
}

/// Which rule selected the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    Custom,
    Explicit,
    Subagent,
    Image,
    Think,
    Background,
    LongContext,
    WebSearch,
    Default,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Custom => "custom",
            Self::Explicit => "explicit",
            Self::Subagent => "subagent",
            Self::Image => "image",
            Self::Think => "think",
            Self::Background => "background",
            Self::LongContext => "longContext",
            Self::WebSearch => "webSearch",
            Self::Default => "default",
        };
        f.write_str(label)
    }
}

/// Resolved destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub provider: String,
    pub model: String,
    pub reason: RouteReason,
}

fn subagent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<subagent-model>(.*?)</subagent-model>\s*").expect("valid directive pattern")
    })
}

pub struct Router {
    config: Arc<GatewayConfig>,
    background: Regex,
    cache: Arc<AttachmentCache>,
    custom: Option<Arc<dyn CustomRouter>>,
}

impl Router {
    pub fn new(config: Arc<GatewayConfig>, cache: Arc<AttachmentCache>) -> GatewayResult<Self> {
        let pattern = &config.router.background_model_pattern;
        let background = Regex::new(pattern).map_err(|e| {
            GatewayError::configuration(format!("invalid background model pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            config,
            background,
            cache,
            custom: None,
        })
    }

    pub fn with_custom_router(mut self, custom: Arc<dyn CustomRouter>) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Pick the destination and rewrite the request for it.
    ///
    /// On success `request.model` holds the upstream model name.
    pub async fn resolve(&self, request: &mut ChatRequest, request_id: Uuid) -> GatewayResult<RouteDecision> {
        let decision = self.decide(request, request_id).await?;
        debug!(
            request_id = %request_id,
            provider = %decision.provider,
            model = %decision.model,
            reason = %decision.reason,
            "route resolved"
        );
        request.model = decision.model.clone();
        Ok(decision)
    }

    async fn decide(&self, request: &mut ChatRequest, request_id: Uuid) -> GatewayResult<RouteDecision> {
        if let Some(custom) = &self.custom {
            if let Some(target) = custom.route(request, &self.config).await {
                if !target.trim().is_empty() {
                    return self.target(&target, RouteReason::Custom);
                }
            }
        }

        if request.model.contains(',') {
            let target = request.model.clone();
            return self.target(&target, RouteReason::Explicit);
        }

        if let Some(target) = take_subagent_directive(request) {
            return self.target(&target, RouteReason::Subagent);
        }

        let rules = &self.config.router;

        if rules.image_routing && image::has_inline_image(request) {
            if rules.force_inline_images {
                image::hoist_inline_images(request);
            } else {
                image::rewrite_to_markers(request, &request_id.to_string(), &self.cache);
            }
            return self.slot(rules.image.as_deref(), RouteReason::Image);
        }

        if request.thinking_enabled() {
            return self.slot(rules.think.as_deref(), RouteReason::Think);
        }

        if self.background.is_match(&request.model) {
            return self.slot(rules.background.as_deref(), RouteReason::Background);
        }

        let tokens = estimate_request_tokens(request);
        if tokens > rules.long_context_threshold {
            debug!(request_id = %request_id, tokens, "long context request");
            return self.slot(rules.long_context.as_deref(), RouteReason::LongContext);
        }

        if request.tools.iter().flatten().any(|tool| tool.is_web_search()) {
            return self.slot(rules.web_search.as_deref(), RouteReason::WebSearch);
        }

        self.slot(None, RouteReason::Default)
    }

    /// A rule slot, falling back to `default` when empty
    fn slot(&self, target: Option<&str>, reason: RouteReason) -> GatewayResult<RouteDecision> {
        match target.filter(|t| !t.trim().is_empty()) {
            Some(target) => self.target(target, reason),
            None => match self.config.router.default.as_deref().filter(|t| !t.trim().is_empty()) {
                Some(default) => self.target(default, reason),
                None => Err(GatewayError::configuration(format!(
                    "no route for '{}' and no default route is configured",
                    reason
                ))),
            },
        }
    }

    fn target(&self, target: &str, reason: RouteReason) -> GatewayResult<RouteDecision> {
        let (provider, model) = parse_route_target(target).ok_or_else(|| {
            GatewayError::configuration(format!(
                "invalid {} route '{}': expected \"provider,model\"",
                reason, target
            ))
        })?;

        let profile = self.config.provider(provider).ok_or_else(|| {
            GatewayError::configuration(format!("{} route references unknown provider '{}'", reason, provider))
        })?;
        if !profile.serves(model) {
            return Err(GatewayError::configuration(format!(
                "{} route references model '{}' which provider '{}' does not serve",
                reason, model, provider
            )));
        }

        Ok(RouteDecision {
            provider: provider.to_string(),
            model: model.to_string(),
            reason,
        })
    }
}

/// Remove a `<subagent-model>` directive from the system prompt, returning its target
fn take_subagent_directive(request: &mut ChatRequest) -> Option<String> {
    let pattern = subagent_pattern();
    let mut found = None;

    let mut strip = |text: &mut String| {
        if found.is_some() {
            return;
        }
        let target = pattern
            .captures(text)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().trim().to_string());
        if target.is_some() {
            *text = pattern.replace(text, "").into_owned();
            found = target;
        }
    };

    match request.system.as_mut()? {
        SystemPrompt::Text(text) => strip(text),
        SystemPrompt::Blocks(blocks) => {
            for block in blocks.iter_mut() {
                if let ContentBlock::Text { text, .. } = block {
                    strip(text);
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentCacheConfig;
    use crate::config::{ProviderProfile, RoutingRules, SecretString};
    use crate::protocol::{ImageSource, Message, ToolDefinition};

    fn profile(name: &str, models: &[&str]) -> ProviderProfile {
        ProviderProfile {
            name: name.into(),
            base_url: format!("https://{}.example.com/v1", name),
            api_keys: vec![SecretString::new("k")],
            models: models.iter().map(|m| m.to_string()).collect(),
            transformer: Default::default(),
        }
    }

    fn rules() -> RoutingRules {
        RoutingRules {
            default: Some("a,m1".into()),
            think: Some("a,m2".into()),
            background: Some("b,small".into()),
            long_context: Some("b,large".into()),
            web_search: Some("b,search".into()),
            image: Some("b,vision".into()),
            long_context_threshold: 50,
            ..Default::default()
        }
    }

    fn router(rules: RoutingRules) -> Router {
        let config = GatewayConfig {
            providers: vec![
                profile("a", &["m1", "m2"]),
                profile("b", &["small", "large", "search", "vision"]),
            ],
            router: rules,
            ..Default::default()
        };
        Router::new(Arc::new(config), Arc::new(AttachmentCache::new(AttachmentCacheConfig::default())))
            .unwrap()
    }

    async fn resolve(router: &Router, mut request: ChatRequest) -> GatewayResult<RouteDecision> {
        router.resolve(&mut request, Uuid::new_v4()).await
    }

    fn image_request() -> ChatRequest {
        ChatRequest::new(
            "claude-sonnet",
            vec![Message::user_blocks(vec![ContentBlock::Image {
                source: ImageSource::Base64 {
                    media_type: "image/png".into(),
                    data: "aGVsbG8=".into(),
                },
            }])],
        )
    }

    #[tokio::test]
    async fn test_precedence() {
        let router = router(rules());
        let plain = ChatRequest::new("claude-sonnet", vec![Message::user("hi")]);

        let decision = resolve(&router, plain.clone()).await.unwrap();
        assert_eq!((decision.provider.as_str(), decision.model.as_str()), ("a", "m1"));
        assert_eq!(decision.reason, RouteReason::Default);

        let think = plain.clone().with_thinking(1024);
        assert_eq!(resolve(&router, think).await.unwrap().reason, RouteReason::Think);

        let mut background = plain.clone();
        background.model = "claude-3-5-haiku".into();
        assert_eq!(resolve(&router, background).await.unwrap().model, "small");

        let long = ChatRequest::new("claude-sonnet", vec![Message::user("word ".repeat(200))]);
        assert_eq!(resolve(&router, long).await.unwrap().reason, RouteReason::LongContext);

        let search = plain.clone().with_tools(vec![ToolDefinition {
            name: "web_search".into(),
            description: None,
            input_schema: None,
            kind: Some("web_search_20250305".into()),
        }]);
        assert_eq!(resolve(&router, search).await.unwrap().model, "search");

        let both = image_request().with_thinking(1024);
        assert_eq!(resolve(&router, both).await.unwrap().reason, RouteReason::Image);
    }

    #[tokio::test]
    async fn test_resolve_rewrites_model() {
        let router = router(rules());
        let mut request = ChatRequest::new("claude-sonnet", vec![Message::user("hi")]);
        router.resolve(&mut request, Uuid::new_v4()).await.unwrap();
        assert_eq!(request.model, "m1");
    }

    #[tokio::test]
    async fn test_empty_slot_falls_back_to_default() {
        let router = router(RoutingRules {
            default: Some("a,m1".into()),
            ..Default::default()
        });
        let decision = resolve(&router, ChatRequest::new("x", vec![Message::user("hi")]).with_thinking(10))
            .await
            .unwrap();
        assert_eq!(decision.model, "m1");
        assert_eq!(decision.reason, RouteReason::Think);
    }

    #[tokio::test]
    async fn test_missing_default_is_configuration_error() {
        let router = router(RoutingRules::default());
        let err = resolve(&router, ChatRequest::new("x", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_explicit_target_validated() {
        let router = router(rules());
        let ok = resolve(&router, ChatRequest::new("b,large", vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(ok.reason, RouteReason::Explicit);

        let err = resolve(&router, ChatRequest::new("b,m1", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not serve"));
    }

    #[tokio::test]
    async fn test_subagent_directive_stripped() {
        let router = router(rules());
        let mut request = ChatRequest::new("claude-sonnet", vec![Message::user("hi")])
            .with_system("<subagent-model>b,large</subagent-model>You review code.");
        let decision = router.resolve(&mut request, Uuid::new_v4()).await.unwrap();
        assert_eq!(decision.reason, RouteReason::Subagent);
        assert_eq!(request.system.unwrap().text(), "You review code.");
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl CustomRouter for Fixed {
        async fn route(&self, _request: &ChatRequest, _config: &GatewayConfig) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_custom_router_wins_and_is_validated() {
        let custom = router(rules()).with_custom_router(Arc::new(Fixed("b,vision")));
        let decision = resolve(&custom, ChatRequest::new("x", vec![Message::user("hi")]).with_thinking(10))
            .await
            .unwrap();
        assert_eq!(decision.reason, RouteReason::Custom);
        assert_eq!(decision.model, "vision");

        let bad = router(rules()).with_custom_router(Arc::new(Fixed("nope,x")));
        assert!(resolve(&bad, ChatRequest::new("x", vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_image_routing_disabled() {
        let router = router(RoutingRules {
            image_routing: false,
            ..rules()
        });
        let decision = resolve(&router, image_request()).await.unwrap();
        assert_eq!(decision.reason, RouteReason::Default);
    }

    #[tokio::test]
    async fn test_inline_mode_keeps_images() {
        let router = router(RoutingRules {
            force_inline_images: true,
            ..rules()
        });
        let mut request = image_request();
        let decision = router.resolve(&mut request, Uuid::new_v4()).await.unwrap();
        assert_eq!(decision.model, "vision");
        assert!(image::has_inline_image(&request));
        assert!(request.tools.is_none());
    }
}
