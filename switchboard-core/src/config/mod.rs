//! Configuration module for the gateway
//!
//! Provider profiles, routing rules and resilience settings are loaded from
//! YAML or JSON. `${VAR}` references are resolved from the environment before
//! parsing, and the result passes [`ConfigValidator`] before it is returned.

mod env;
mod error;
mod schema;
mod secrets;
mod validator;

pub use error::{ConfigError, ConfigResult, ValidationError, ValidationErrorKind};
pub use schema::{
    parse_route_target, ChainPolicy, ConnectionConfig, GatewayConfig, ProviderProfile,
    ResilienceConfig, RoutingRules, StageSpec, TransformerConfig,
};
pub use secrets::SecretString;
pub use validator::ConfigValidator;

use std::fs;
use std::path::Path;

/// Parse and validate a YAML configuration string
pub fn from_yaml_str(content: &str) -> ConfigResult<GatewayConfig> {
    parse_yaml("<inline>", content)
}

/// Parse and validate a JSON configuration string
pub fn from_json_str(content: &str) -> ConfigResult<GatewayConfig> {
    parse_json("<inline>", content)
}

/// Load a configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> ConfigResult<GatewayConfig> {
    let path = path.as_ref();
    let content = read(path)?;
    parse_yaml(&path.to_string_lossy(), &content)
}

/// Load a configuration from a JSON file
pub fn load_from_json<P: AsRef<Path>>(path: P) -> ConfigResult<GatewayConfig> {
    let path = path.as_ref();
    let content = read(path)?;
    parse_json(&path.to_string_lossy(), &content)
}

fn read(path: &Path) -> ConfigResult<String> {
    fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_string_lossy().to_string(),
        source: e,
    })
}

fn parse_yaml(path: &str, content: &str) -> ConfigResult<GatewayConfig> {
    let interpolated = env::interpolate_env_vars(content)?;

    let config: GatewayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            line: e.location().map(|l| l.line()),
            column: e.location().map(|l| l.column()),
            message: e.to_string(),
        })?;

    ConfigValidator::new().validate(&config)?;
    tracing::debug!(path, providers = config.providers.len(), "loaded gateway configuration");
    Ok(config)
}

fn parse_json(path: &str, content: &str) -> ConfigResult<GatewayConfig> {
    let interpolated = env::interpolate_env_vars(content)?;

    let config: GatewayConfig =
        serde_json::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            line: Some(e.line()),
            column: Some(e.column()),
            message: e.to_string(),
        })?;

    ConfigValidator::new().validate(&config)?;
    tracing::debug!(path, providers = config.providers.len(), "loaded gateway configuration");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_valid_yaml() {
        let yaml = r#"
providers:
  - name: deepseek
    base_url: https://api.deepseek.com/chat/completions
    api_keys: [sk-a, sk-b]
    models: [deepseek-chat, deepseek-reasoner]
    transformer:
      use: [openai]
      models:
        deepseek-chat:
          - [maxtoken, {max_tokens: 8192}]
router:
  default: deepseek,deepseek-chat
  think: deepseek,deepseek-reasoner
resilience:
  circuit_breaker:
    failure_threshold: 3
"#;
        let config = from_yaml_str(yaml).unwrap();
        assert_eq!(config.providers[0].api_keys.len(), 2);
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.resilience.circuit_breaker.success_threshold, 3);
        assert_eq!(config.router.long_context_threshold, 60_000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
providers:
  - name: a
    base_url: https://a.example.com
    api_key: k
    models: [m1]
    weight: 3
"#;
        assert!(matches!(
            from_yaml_str(yaml),
            Err(ConfigError::Parse { .. })
        ));
    }
}
