//! Ordered stage chains

use super::registry::StageRegistry;
use super::{Stage, StreamChunk, StreamState, TransformContext, Transformer};
use crate::config::{ChainPolicy, ProviderProfile};
use crate::error::{GatewayError, GatewayResult};
use crate::http::OutboundRequest;
use crate::protocol::ChatResponse;
use serde_json::Value;

/// The stages applied to one provider/model pair
#[derive(Debug, Clone, Default)]
pub struct TransformerChain {
    stages: Vec<Stage>,
}

impl TransformerChain {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// The provider's global stages, then the model's stages (or only the model's
    /// stages under the `replace` policy)
    pub fn build(
        registry: &StageRegistry,
        profile: &ProviderProfile,
        model: &str,
    ) -> GatewayResult<Self> {
        let transformer = &profile.transformer;
        let model_stages = transformer.models.get(model);

        let specs: Vec<_> = match (transformer.model_policy, model_stages) {
            (ChainPolicy::Replace, Some(stages)) => stages.iter().collect(),
            (_, Some(stages)) => transformer.stages.iter().chain(stages).collect(),
            (_, None) => transformer.stages.iter().collect(),
        };

        let stages = specs
            .into_iter()
            .map(|spec| registry.build(spec))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { stages })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Transformer::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// One stream state per stage
    pub fn new_stream_states(&self) -> Vec<StreamState> {
        self.stages.iter().map(|_| StreamState::new()).collect()
    }

    /// Fold the request through every stage in order
    pub fn apply_request(
        &self,
        mut request: OutboundRequest,
        ctx: &mut TransformContext,
    ) -> GatewayResult<OutboundRequest> {
        for stage in &self.stages {
            request = stage
                .transform_request(request, ctx)
                .map_err(|e| e.into_gateway(stage.name()))?;
        }
        Ok(request)
    }

    /// Fold the raw response back through the stages and decode it
    pub fn apply_response(&self, raw: Value, ctx: &TransformContext) -> GatewayResult<ChatResponse> {
        let mut body = raw;
        for stage in self.stages.iter().rev() {
            body = stage
                .transform_response(body, ctx)
                .map_err(|e| e.into_gateway(stage.name()))?;
        }

        serde_json::from_value(body).map_err(|e| {
            let stage = self.stages.first().map_or("canonical", |s| s.name());
            GatewayError::transform(stage, format!("response is not canonical: {}", e))
        })
    }

    /// Run one upstream chunk back through the stages
    pub fn apply_stream_chunk(
        &self,
        chunk: StreamChunk,
        ctx: &TransformContext,
        states: &mut [StreamState],
    ) -> GatewayResult<Vec<StreamChunk>> {
        let mut chunks = vec![chunk];
        for (stage, state) in self.stages.iter().zip(states.iter_mut()).rev() {
            let mut next = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                next.extend(
                    stage
                        .transform_stream_chunk(chunk, ctx, state)
                        .map_err(|e| e.into_gateway(stage.name()))?,
                );
            }
            chunks = next;
        }
        Ok(chunks)
    }
}
