//! Configuration validation utilities
//!
//! Cross-reference checks that need more than a single struct: routing targets,
//! the background pattern, and transformer stage names.

use super::error::ValidationError;
use super::schema::{parse_route_target, GatewayConfig, StageSpec};
use crate::transform::StageRegistry;
use regex::Regex;
use std::collections::HashSet;

/// Configuration validator with cross-reference rules
pub struct ConfigValidator {
    known_stages: HashSet<String>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Validator aware of the built-in transformer stages
    pub fn new() -> Self {
        Self::with_registry(&StageRegistry::with_builtins())
    }

    /// Validator aware of every stage in `registry`
    pub fn with_registry(registry: &StageRegistry) -> Self {
        Self {
            known_stages: registry.names().map(str::to_string).collect(),
        }
    }

    /// Validate a configuration with extended rules
    pub fn validate(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        config.validate()?;

        self.validate_routes(config)?;
        self.validate_background_pattern(config)?;
        self.validate_stages(config)?;

        Ok(())
    }

    /// Every configured slot must name a declared provider and model
    fn validate_routes(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        for (slot, target) in config.router.slots() {
            let Some(target) = target else { continue };
            let path = format!("router.{}", slot);

            let (provider_name, model) = parse_route_target(target).ok_or_else(|| {
                ValidationError::malformed(&path, "Expected \"provider,model\"")
            })?;

            let provider = config.provider(provider_name).ok_or_else(|| {
                ValidationError::unknown_reference(&path, provider_name)
                    .with_hint("Route targets an undeclared provider")
            })?;

            if !provider.serves(model) {
                return Err(ValidationError::unknown_reference(&path, target)
                    .with_hint(format!("Provider '{}' does not serve this model", provider_name)));
            }
        }

        Ok(())
    }

    fn validate_background_pattern(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        Regex::new(&config.router.background_model_pattern).map_err(|e| {
            ValidationError::malformed("router.backgroundModelPattern", e.to_string())
        })?;
        Ok(())
    }

    /// Transformer stage names must be registered
    fn validate_stages(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        for (i, provider) in config.providers.iter().enumerate() {
            let base = format!("providers[{}].transformer", i);
            self.check_stage_list(&format!("{}.use", base), &provider.transformer.stages)?;

            for (model, stages) in &provider.transformer.models {
                self.check_stage_list(&format!("{}.models.{}", base, model), stages)?;
            }
        }

        Ok(())
    }

    fn check_stage_list(&self, path: &str, stages: &[StageSpec]) -> Result<(), ValidationError> {
        for (j, stage) in stages.iter().enumerate() {
            if !self.known_stages.contains(stage.name()) {
                return Err(ValidationError::unknown_stage(
                    format!("{}[{}]", path, j),
                    stage.name(),
                ));
            }
        }
        Ok(())
    }
}
