//! Per-stage stream bookkeeping
//!
//! Delta-based upstream formats (OpenAI chunks, Gemini partial responses) do not
//! announce block boundaries. [`StreamState`] tracks which canonical block is open
//! and emits the start/stop events around the deltas it is fed.

use super::StreamChunk;
use crate::protocol::{
    ContentBlock, ContentDelta, MessageDeltaBody, MessageStart, Role, StopReason, StreamEvent,
    Usage,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    index: usize,
    kind: BlockKind,
}

/// Stream progress of one stage for one request
#[derive(Debug, Default)]
pub struct StreamState {
    started: bool,
    finished: bool,
    open: Option<OpenBlock>,
    next_index: usize,
    /// Upstream tool key → canonical block index
    tools: HashMap<usize, usize>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    /// Free-form notes for stage implementations
    pub notes: HashMap<String, Value>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// `message_start`, once
    pub fn start_message(&mut self, id: &str, model: &str) -> Vec<StreamChunk> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![StreamChunk::canonical(&StreamEvent::MessageStart {
            message: MessageStart {
                id: id.to_string(),
                model: model.to_string(),
                role: Role::Assistant,
                usage: self.usage,
            },
        })]
    }

    pub fn text_delta(&mut self, text: &str) -> Vec<StreamChunk> {
        if text.is_empty() {
            return Vec::new();
        }
        let (index, mut out) = self.ensure_block(BlockKind::Text);
        out.push(StreamChunk::canonical(&StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta {
                text: text.to_string(),
            },
        }));
        out
    }

    pub fn thinking_delta(&mut self, thinking: &str) -> Vec<StreamChunk> {
        if thinking.is_empty() {
            return Vec::new();
        }
        let (index, mut out) = self.ensure_block(BlockKind::Thinking);
        out.push(StreamChunk::canonical(&StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        }));
        out
    }

    /// Open a tool-use block for upstream tool `key`
    pub fn start_tool(&mut self, key: usize, id: &str, name: &str) -> Vec<StreamChunk> {
        let mut out = self.close_open_block();
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some(OpenBlock {
            index,
            kind: BlockKind::ToolUse,
        });
        self.tools.insert(key, index);
        out.push(StreamChunk::canonical(&StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: Value::Object(Default::default()),
            },
        }));
        out
    }

    pub fn has_tool(&self, key: usize) -> bool {
        self.tools.contains_key(&key)
    }

    /// Argument fragment for upstream tool `key`.
    ///
    /// Dropped if the tool never started or its block was already closed.
    pub fn tool_args_delta(&mut self, key: usize, partial_json: &str) -> Vec<StreamChunk> {
        if partial_json.is_empty() {
            return Vec::new();
        }
        let Some(&index) = self.tools.get(&key) else {
            return Vec::new();
        };
        if self.open.map(|open| open.index) != Some(index) {
            warn!(tool = key, index, "dropping arguments for a closed tool block");
            return Vec::new();
        }
        vec![StreamChunk::canonical(&StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::InputJsonDelta {
                partial_json: partial_json.to_string(),
            },
        })]
    }

    pub fn set_stop_reason(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.usage = usage;
    }

    /// Close the open block and end the message, once
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = self.close_open_block();
        let stop_reason = self.stop_reason.or_else(|| {
            if self.tools.is_empty() {
                Some(StopReason::EndTurn)
            } else {
                Some(StopReason::ToolUse)
            }
        });
        out.push(StreamChunk::canonical(&StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason,
                stop_sequence: None,
            },
            usage: Some(self.usage),
        }));
        out.push(StreamChunk::canonical(&StreamEvent::MessageStop));
        out
    }

    fn ensure_block(&mut self, kind: BlockKind) -> (usize, Vec<StreamChunk>) {
        if let Some(open) = self.open {
            if open.kind == kind {
                return (open.index, Vec::new());
            }
        }

        let mut out = self.close_open_block();
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some(OpenBlock { index, kind });

        let content_block = match kind {
            BlockKind::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            _ => ContentBlock::text(""),
        };
        out.push(StreamChunk::canonical(&StreamEvent::ContentBlockStart {
            index,
            content_block,
        }));
        (index, out)
    }

    fn close_open_block(&mut self) -> Vec<StreamChunk> {
        match self.open.take() {
            Some(open) => vec![StreamChunk::canonical(&StreamEvent::ContentBlockStop {
                index: open.index,
            })],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(chunks: &[StreamChunk]) -> Vec<String> {
        chunks
            .iter()
            .filter_map(|c| c.kind().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_text_then_tool_then_finish() {
        let mut state = StreamState::new();
        let mut out = state.start_message("msg_1", "m1");
        out.extend(state.start_message("msg_1", "m1"));
        out.extend(state.text_delta("Hel"));
        out.extend(state.text_delta("lo"));
        out.extend(state.start_tool(0, "call_1", "search"));
        out.extend(state.tool_args_delta(0, "{\"q\":"));
        out.extend(state.finish());
        out.extend(state.finish());

        assert_eq!(
            kinds(&out),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let StreamChunk::Event { data, .. } = &out[8] else {
            panic!("expected message_delta");
        };
        assert_eq!(data["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_thinking_switches_blocks() {
        let mut state = StreamState::new();
        let mut out = state.thinking_delta("hmm");
        out.extend(state.text_delta("answer"));
        let StreamChunk::Event { data, .. } = &out[3] else {
            panic!("expected event");
        };
        assert_eq!(data["index"], 1);
        assert_eq!(data["content_block"]["type"], "text");
    }

    #[test]
    fn test_late_delta_for_closed_tool_dropped() {
        let mut state = StreamState::new();
        let mut out = state.start_tool(0, "call_a", "read");
        out.extend(state.tool_args_delta(0, "{\"path\":"));
        out.extend(state.start_tool(1, "call_b", "grep"));
        out.extend(state.tool_args_delta(1, "{\"q\":1}"));
        assert!(state.tool_args_delta(0, "\"a.rs\"}").is_empty());

        let indices: Vec<u64> = out
            .iter()
            .filter(|c| c.kind() == Some("content_block_delta"))
            .filter_map(|c| match c {
                StreamChunk::Event { data, .. } => data["index"].as_u64(),
                StreamChunk::Done => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_unknown_tool_delta_dropped() {
        let mut state = StreamState::new();
        assert!(state.tool_args_delta(3, "{}").is_empty());
    }
}
