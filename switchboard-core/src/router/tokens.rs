//! Token estimation for long-context routing

use crate::protocol::{ChatRequest, ContentBlock, MessageContent, ToolResultContent};
use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "failed to load cl100k_base, falling back to length estimate");
                None
            }
        })
        .as_ref()
}

fn count_text(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.len().div_ceil(4),
    }
}

fn count_block(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text, .. } => count_text(text),
        ContentBlock::ToolUse { name, input, .. } => count_text(name) + count_text(&input.to_string()),
        ContentBlock::ToolResult { content, .. } => match content {
            Some(ToolResultContent::Text(text)) => count_text(text),
            Some(ToolResultContent::Blocks(blocks)) => blocks.iter().map(count_block).sum(),
            None => 0,
        },
        ContentBlock::Thinking { thinking, .. } => count_text(thinking),
        ContentBlock::ServerToolUse { name, input, .. } => count_text(name) + count_text(&input.to_string()),
        ContentBlock::WebSearchToolResult { content, .. } | ContentBlock::Other(content) => {
            count_text(&content.to_string())
        }
        ContentBlock::Image { .. } | ContentBlock::RedactedThinking { .. } => 0,
    }
}

/// Estimated prompt size: message text, system prompt and tool definitions
pub fn estimate_request_tokens(request: &ChatRequest) -> usize {
    let messages: usize = request
        .messages
        .iter()
        .map(|message| match &message.content {
            MessageContent::Text(text) => count_text(text),
            MessageContent::Blocks(blocks) => blocks.iter().map(count_block).sum(),
        })
        .sum();

    let system = request
        .system
        .as_ref()
        .map_or(0, |system| count_text(&system.text()));

    let tools: usize = request
        .tools
        .iter()
        .flatten()
        .map(|tool| {
            count_text(&tool.name)
                + tool.description.as_deref().map_or(0, count_text)
                + tool
                    .input_schema
                    .as_ref()
                    .map_or(0, |schema| count_text(&schema.to_string()))
        })
        .sum();

    messages + system + tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, ToolDefinition};
    use serde_json::json;

    #[test]
    fn test_counts_every_part() {
        let bare = ChatRequest::new("m", vec![Message::user("hello world")]);
        let base = estimate_request_tokens(&bare);
        assert!(base >= 2);

        let with_system = bare.clone().with_system("you are terse");
        assert!(estimate_request_tokens(&with_system) > base);

        let with_tools = bare.with_tools(vec![ToolDefinition {
            name: "read_file".into(),
            description: Some("Read a file".into()),
            input_schema: Some(json!({"type": "object"})),
            kind: None,
        }]);
        assert!(estimate_request_tokens(&with_tools) > base);
    }

    #[test]
    fn test_empty_request() {
        assert_eq!(estimate_request_tokens(&ChatRequest::default()), 0);
    }
}
