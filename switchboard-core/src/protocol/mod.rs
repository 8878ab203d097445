//! Protocol module for canonical request/response structures
//!
//! This module defines the canonical data models the gateway speaks to its callers.
//! These structures are designed to be:
//! - Provider-agnostic
//! - Streaming-aware (event-level types live in [`stream`])
//! - Lossless for the content blocks coding assistants rely on (tools, images, thinking)

pub mod stream;
pub mod types;

pub use stream::{ContentDelta, MessageDeltaBody, MessageStart, StreamEvent};
pub use types::{
    ChatRequest, ChatResponse, ContentBlock, ErrorBody, ErrorResponse, ImageSource, Message,
    MessageContent, Role, StopReason, SystemPrompt, ThinkingConfig, ToolDefinition,
    ToolResultContent, Usage,
};
