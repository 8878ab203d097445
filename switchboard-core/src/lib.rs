//! Switchboard Core Library
//!
//! This crate provides the engine of a multi-provider LLM gateway: it routes a
//! canonical chat request to a provider/model, translates it into that
//! provider's wire format through a chain of transformer stages, sends it with
//! circuit breaking, retries and API-key rotation, and translates the answer
//! (including server-sent event streams) back.

pub mod attachment;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod protocol;
pub mod resilience;
pub mod router;
pub mod stream;
pub mod transform;

pub use attachment::{AttachmentCache, AttachmentCacheConfig, AttachmentPayload};
pub use config::GatewayConfig;
pub use dispatcher::{Gateway, GatewayBuilder, GatewayResponse};
pub use error::{GatewayError, GatewayResult};
pub use protocol::{ChatRequest, ChatResponse, StreamEvent};
pub use router::{CustomRouter, RouteDecision, RouteReason, Router};
pub use stream::EventStream;

/// Returns the version of the Switchboard Core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
