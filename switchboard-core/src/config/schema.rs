//! Configuration schema structures with serde support

use super::error::ValidationError;
use super::secrets::SecretString;
use crate::attachment::AttachmentCacheConfig;
use crate::resilience::{CircuitBreakerConfig, KeyRotationConfig, RetryPolicy};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Root configuration structure for the gateway
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Upstream LLM providers
    #[serde(default)]
    pub providers: Vec<ProviderProfile>,

    /// Routing rules
    #[serde(default)]
    pub router: RoutingRules,

    /// Circuit breaker, key rotation and retry settings
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Image side-channel cache settings
    #[serde(default)]
    pub attachments: AttachmentCacheConfig,

    /// Outbound HTTP settings
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Upstream provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderProfile {
    /// Unique provider name
    pub name: String,

    /// Endpoint URL for the provider API
    pub base_url: String,

    /// API keys in rotation order (`api_key` with a single string is accepted)
    #[serde(alias = "api_key", deserialize_with = "one_or_many")]
    pub api_keys: Vec<SecretString>,

    /// Models served by this provider
    #[serde(default)]
    pub models: Vec<String>,

    /// Transformer stages applied to this provider's traffic
    #[serde(default)]
    pub transformer: TransformerConfig,
}

impl ProviderProfile {
    /// Whether the provider declares `model`
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// Transformer stage lists of a provider
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransformerConfig {
    /// Stages applied to every model of the provider
    #[serde(default, rename = "use")]
    pub stages: Vec<StageSpec>,

    /// Model-specific stage lists
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub models: HashMap<String, Vec<StageSpec>>,

    /// How model lists combine with the provider list
    #[serde(default)]
    pub model_policy: ChainPolicy,
}

/// Composition of global and model-specific stage lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPolicy {
    /// Model stages run after the provider stages
    #[default]
    Append,
    /// Model stages replace the provider stages
    Replace,
}

/// A stage reference: `name` or `[name, {options}]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StageSpec {
    Name(String),
    WithOptions(String, Map<String, Value>),
}

impl StageSpec {
    pub fn name(&self) -> &str {
        match self {
            StageSpec::Name(name) | StageSpec::WithOptions(name, _) => name,
        }
    }

    pub fn options(&self) -> Map<String, Value> {
        match self {
            StageSpec::Name(_) => Map::new(),
            StageSpec::WithOptions(_, options) => options.clone(),
        }
    }
}

/// Routing slots and routing switches
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RoutingRules {
    #[serde(default)]
    pub default: Option<String>,

    #[serde(default)]
    pub think: Option<String>,

    #[serde(default)]
    pub background: Option<String>,

    #[serde(default)]
    pub long_context: Option<String>,

    #[serde(default)]
    pub web_search: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    /// Token count above which `longContext` is selected
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: usize,

    /// Requested model names matching this pattern go to `background`
    #[serde(default = "default_background_pattern")]
    pub background_model_pattern: String,

    /// Route requests carrying inline images to `image`
    #[serde(default = "default_true")]
    pub image_routing: bool,

    /// Keep images inline for the vision model instead of replacing them with markers
    #[serde(default)]
    pub force_inline_images: bool,
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self {
            default: None,
            think: None,
            background: None,
            long_context: None,
            web_search: None,
            image: None,
            long_context_threshold: default_long_context_threshold(),
            background_model_pattern: default_background_pattern(),
            image_routing: true,
            force_inline_images: false,
        }
    }
}

impl RoutingRules {
    /// Named slots with their configured targets
    pub fn slots(&self) -> [(&'static str, Option<&str>); 6] {
        [
            ("default", self.default.as_deref()),
            ("think", self.think.as_deref()),
            ("background", self.background.as_deref()),
            ("longContext", self.long_context.as_deref()),
            ("webSearch", self.web_search.as_deref()),
            ("image", self.image.as_deref()),
        ]
    }
}

/// Split a `"provider,model"` reference
pub fn parse_route_target(target: &str) -> Option<(&str, &str)> {
    let (provider, model) = target.split_once(',')?;
    let (provider, model) = (provider.trim(), model.trim());
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}

/// Resilience settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub key_rotation: KeyRotationConfig,

    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Maximum idle connections per host
    #[serde(default = "default_max_idle")]
    pub max_idle_per_host: usize,

    /// Keep-alive timeout in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Optional outbound proxy URL
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_idle_per_host: default_max_idle(),
            keepalive_secs: default_keepalive(),
            proxy_url: None,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// Default value functions for serde
fn default_true() -> bool { true }
fn default_long_context_threshold() -> usize { 60_000 }
fn default_background_pattern() -> String { "(?i)haiku".to_string() }
fn default_connect_timeout() -> u64 { 10_000 }
fn default_request_timeout() -> u64 { 600_000 }
fn default_max_idle() -> usize { 10 }
fn default_keepalive() -> u64 { 90 }

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(SecretString),
        Many(Vec<SecretString>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(key) => vec![key],
        OneOrMany::Many(keys) => keys,
    })
}

impl GatewayConfig {
    /// Look up a provider by name
    pub fn provider(&self, name: &str) -> Option<&ProviderProfile> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Validate the structural configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.providers.is_empty() {
            return Err(ValidationError::missing("providers")
                .with_hint("At least one provider must be configured"));
        }

        let mut seen_names = HashSet::new();
        for (i, provider) in self.providers.iter().enumerate() {
            if !seen_names.insert(&provider.name) {
                return Err(ValidationError::duplicate(
                    format!("providers[{}].name", i),
                    provider.name.clone(),
                ));
            }

            provider.validate(&format!("providers[{}]", i))?;
        }

        if self.router.long_context_threshold == 0 {
            return Err(ValidationError::out_of_range(
                "router.longContextThreshold",
                "Must be greater than 0",
            ));
        }

        self.resilience.validate("resilience")?;

        if self.attachments.capacity == 0 {
            return Err(ValidationError::out_of_range(
                "attachments.capacity",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl ProviderProfile {
    /// Validate provider configuration
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::missing(format!("{}.name", path)));
        }

        if self.name.contains(',') {
            return Err(ValidationError::malformed(
                format!("{}.name", path),
                "Provider names cannot contain ','",
            ));
        }

        if self.api_keys.is_empty() || self.api_keys.iter().any(SecretString::is_empty) {
            return Err(ValidationError::missing(format!("{}.api_keys", path)));
        }

        if self.base_url.is_empty() {
            return Err(ValidationError::missing(format!("{}.base_url", path)));
        }

        match url::Url::parse(&self.base_url) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::bad_url(
                        format!("{}.base_url", path),
                        format!("URL scheme must be http or https, got: {}", url.scheme()),
                    ));
                }
            }
            Err(e) => {
                return Err(ValidationError::bad_url(format!("{}.base_url", path), e.to_string()));
            }
        }

        if self.models.is_empty() {
            return Err(ValidationError::missing(format!("{}.models", path)));
        }

        let mut seen_models = HashSet::new();
        for (i, model) in self.models.iter().enumerate() {
            if model.is_empty() {
                return Err(ValidationError::missing(format!("{}.models[{}]", path, i)));
            }
            if !seen_models.insert(model) {
                return Err(ValidationError::duplicate(
                    format!("{}.models[{}]", path, i),
                    model.clone(),
                ));
            }
        }

        for model in self.transformer.models.keys() {
            if !self.serves(model) {
                return Err(ValidationError::unknown_reference(
                    format!("{}.transformer.models.{}", path, model),
                    model.clone(),
                )
                .with_hint("Model-specific stages must target a declared model"));
            }
        }

        Ok(())
    }
}

impl ResilienceConfig {
    /// Validate resilience settings
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ValidationError::out_of_range(
                format!("{}.circuit_breaker.failure_threshold", path),
                "Must be greater than 0",
            ));
        }

        if self.circuit_breaker.success_threshold == 0 {
            return Err(ValidationError::out_of_range(
                format!("{}.circuit_breaker.success_threshold", path),
                "Must be greater than 0",
            ));
        }

        if self.key_rotation.max_delay_ms < self.key_rotation.base_delay_ms {
            return Err(ValidationError::out_of_range(
                format!("{}.key_rotation.max_delay_ms", path),
                "Must be >= base_delay_ms",
            ));
        }

        if self.retry.max_timeout_ms < self.retry.min_timeout_ms {
            return Err(ValidationError::out_of_range(
                format!("{}.retry.max_timeout_ms", path),
                "Must be >= min_timeout_ms",
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ValidationError::out_of_range(
                format!("{}.retry.jitter_factor", path),
                "Must be between 0.0 and 1.0",
            ));
        }

        Ok(())
    }
}
