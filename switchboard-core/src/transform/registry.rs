//! Stage registry: name → constructor

use super::anthropic::AnthropicStage;
use super::gemini::GeminiStage;
use super::openai::OpenAiStage;
use super::utility::{CleanCacheStage, EnhanceToolStage, MaxTokenStage};
use super::vertex::VertexStage;
use super::{Stage, StageResult};
use crate::config::StageSpec;
use crate::error::{GatewayError, GatewayResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Builds a stage from its options bag
pub type StageConstructor = fn(&Map<String, Value>) -> StageResult<Stage>;

#[derive(Debug, Clone)]
pub struct StageRegistry {
    constructors: BTreeMap<&'static str, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StageRegistry {
    /// Registry without any stages
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in stage
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("openai", |_| Ok(Stage::OpenAi(OpenAiStage)));
        registry.register("anthropic", |o| {
            AnthropicStage::from_options(o).map(Stage::Anthropic)
        });
        registry.register("gemini", |_| Ok(Stage::Gemini(GeminiStage)));
        registry.register("vertex", |o| VertexStage::from_options(o).map(Stage::Vertex));
        registry.register("maxtoken", |o| MaxTokenStage::from_options(o).map(Stage::MaxToken));
        registry.register("cleancache", |_| Ok(Stage::CleanCache(CleanCacheStage)));
        registry.register("enhancetool", |_| EnhanceToolStage::new().map(Stage::EnhanceTool));
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: StageConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.constructors.keys().copied()
    }

    /// Instantiate the stage a `StageSpec` names
    pub fn build(&self, spec: &StageSpec) -> GatewayResult<Stage> {
        let constructor = self.constructors.get(spec.name()).ok_or_else(|| {
            GatewayError::configuration(format!("Unknown transformer stage '{}'", spec.name()))
        })?;
        constructor(&spec.options()).map_err(|e| {
            GatewayError::configuration(format!("Invalid options for stage '{}': {}", spec.name(), e))
        })
    }
}
