//! Image handling for vision routing
//!
//! In marker mode every inline image of the latest user turn is parked in the
//! [`AttachmentCache`] and replaced by an `[Image #n]` marker the model can
//! resolve with the `lookup_attachment` tool. In inline mode images stay in the
//! conversation, but tool-result wrappers are flattened so vision models that
//! reject nested images still see them.

use crate::attachment::{scoped_id, AttachmentCache, AttachmentPayload};
use crate::protocol::{ChatRequest, ContentBlock, MessageContent, Role, ToolDefinition, ToolResultContent};
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Name of the tool that resolves an image marker
pub const LOOKUP_TOOL_NAME: &str = "lookup_attachment";

const NOTE_HEAD: &str = "This image was moved to an attachment. Call the lookup_attachment tool with image_id ";
const NOTE_TAIL: &str = " to view it.";

/// A whole marker: `[Image #n]` plus the lookup note that follows it
fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let pattern = format!(
            r#"\[Image #\d+\](?: {}"[^"]*"{})?\s*"#,
            regex::escape(NOTE_HEAD),
            regex::escape(NOTE_TAIL)
        );
        Regex::new(&pattern).expect("valid marker pattern")
    })
}

/// Whether the latest user turn carries an image, directly or inside a tool result
pub fn has_inline_image(request: &ChatRequest) -> bool {
    request
        .last_user_index()
        .and_then(|i| match &request.messages[i].content {
            MessageContent::Blocks(blocks) => Some(blocks.iter().any(ContentBlock::contains_image)),
            MessageContent::Text(_) => None,
        })
        .unwrap_or(false)
}

/// Declaration of the attachment lookup tool
pub fn lookup_tool() -> ToolDefinition {
    ToolDefinition {
        name: LOOKUP_TOOL_NAME.to_string(),
        description: Some(
            "Fetch an image attached earlier in the conversation. Pass the image_id quoted next to its [Image #n] marker."
                .to_string(),
        ),
        input_schema: Some(json!({
            "type": "object",
            "properties": {
                "image_id": {
                    "type": "string",
                    "description": "Attachment id exactly as quoted next to the marker"
                }
            },
            "required": ["image_id"]
        })),
        kind: None,
    }
}

fn marker_text(n: usize, image_id: &str) -> String {
    format!("[Image #{}] {}\"{}\"{}", n, NOTE_HEAD, image_id, NOTE_TAIL)
}

/// Replace inline images of the latest user turn with markers.
///
/// Returns the number of images moved to the cache.
pub fn rewrite_to_markers(request: &mut ChatRequest, request_id: &str, cache: &AttachmentCache) -> usize {
    strip_stale_markers(request);

    let Some(last) = request.last_user_index() else {
        return 0;
    };

    let mut counter = 0;
    if let MessageContent::Blocks(blocks) = &mut request.messages[last].content {
        let taken = std::mem::take(blocks);
        *blocks = replace_images(taken, request_id, cache, &mut counter);
    }

    if counter > 0 {
        let tools = request.tools.get_or_insert_with(Vec::new);
        if !tools.iter().any(|tool| tool.name == LOOKUP_TOOL_NAME) {
            tools.push(lookup_tool());
        }
        debug!(request_id = %request_id, images = counter, "moved images to attachment cache");
    }
    counter
}

fn replace_images(
    blocks: Vec<ContentBlock>,
    request_id: &str,
    cache: &AttachmentCache,
    counter: &mut usize,
) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .map(|block| match block {
            ContentBlock::Image { source } => {
                let n = *counter + 1;
                let scoped = scoped_id(request_id, n);
                match cache.store(&scoped, AttachmentPayload::from_source(&source)) {
                    Ok(_) => {
                        *counter = n;
                        ContentBlock::text(marker_text(n, &scoped))
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "dropping malformed inline image");
                        ContentBlock::text("[An attached image could not be read and was omitted]")
                    }
                }
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content: Some(ToolResultContent::Blocks(inner)),
                is_error,
            } => ContentBlock::ToolResult {
                tool_use_id,
                content: Some(ToolResultContent::Blocks(replace_images(
                    inner, request_id, cache, counter,
                ))),
                is_error,
            },
            other => other,
        })
        .collect()
}

/// Remove markers left in user text from earlier turns
fn strip_stale_markers(request: &mut ChatRequest) {
    let pattern = marker_pattern();
    for message in request.messages.iter_mut().filter(|m| m.role == Role::User) {
        match &mut message.content {
            MessageContent::Text(text) => {
                if pattern.is_match(text) {
                    *text = pattern.replace_all(text, "").into_owned();
                }
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks.iter_mut() {
                    if let ContentBlock::Text { text, .. } = block {
                        if pattern.is_match(text) {
                            *text = pattern.replace_all(text, "").into_owned();
                        }
                    }
                }
            }
        }
    }
}

/// Flatten tool results holding images and hoist the images into the user turn
pub fn hoist_inline_images(request: &mut ChatRequest) {
    let Some(last) = request.last_user_index() else {
        return;
    };
    let MessageContent::Blocks(blocks) = &mut request.messages[last].content else {
        return;
    };

    let mut hoisted = Vec::new();
    for block in blocks.iter_mut() {
        let ContentBlock::ToolResult { content, .. } = block else {
            continue;
        };
        let Some(ToolResultContent::Blocks(inner)) = content else {
            continue;
        };
        if !inner.iter().any(ContentBlock::contains_image) {
            continue;
        }

        let mut texts = Vec::new();
        for item in std::mem::take(inner) {
            match item {
                ContentBlock::Image { .. } => hoisted.push(item),
                ContentBlock::Text { text, .. } => texts.push(text),
                _ => {}
            }
        }
        *content = Some(ToolResultContent::Text(texts.join("\n")));
    }
    blocks.extend(hoisted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentCacheConfig;
    use crate::protocol::{ImageSource, Message};

    fn image() -> ContentBlock {
        ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: "image/png".into(),
                data: "aGVsbG8=".into(),
            },
        }
    }

    fn count_markers(request: &ChatRequest, marker: &str) -> usize {
        request
            .messages
            .iter()
            .map(|m| m.content.joined_text().matches(marker).count())
            .sum()
    }

    #[test]
    fn test_marker_rewrite() {
        let cache = AttachmentCache::new(AttachmentCacheConfig::default());
        let mut request = ChatRequest::new(
            "m",
            vec![Message::user_blocks(vec![ContentBlock::text("what is this?"), image()])],
        );

        assert!(has_inline_image(&request));
        assert_eq!(rewrite_to_markers(&mut request, "req", &cache), 1);
        assert!(!has_inline_image(&request));
        assert_eq!(count_markers(&request, "[Image #1]"), 1);
        assert!(cache.get("req#1").is_some());
        assert!(cache.get("#1").is_none());
        assert_eq!(cache.len(), 1);
        assert!(request.messages[0]
            .content
            .joined_text()
            .contains("image_id \"req#1\""));
        assert_eq!(request.tools.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_nested_tool_result_images_numbered_in_order() {
        let cache = AttachmentCache::new(AttachmentCacheConfig::default());
        let mut request = ChatRequest::new(
            "m",
            vec![Message::user_blocks(vec![
                image(),
                ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: Some(ToolResultContent::Blocks(vec![image()])),
                    is_error: None,
                },
            ])],
        );
        assert_eq!(rewrite_to_markers(&mut request, "req", &cache), 2);
        assert!(cache.get("req#2").is_some());
        assert_eq!(count_markers(&request, "[Image #1]"), 1);
    }

    #[test]
    fn test_stale_markers_stripped() {
        let cache = AttachmentCache::new(AttachmentCacheConfig::default());
        let mut request = ChatRequest::new(
            "m",
            vec![
                Message::user("[Image #1] describe it"),
                Message::assistant("a cat"),
                Message::user_blocks(vec![image()]),
            ],
        );
        rewrite_to_markers(&mut request, "req", &cache);
        assert_eq!(request.messages[0].content.joined_text(), "describe it");
        assert_eq!(count_markers(&request, "[Image #1]"), 1);
    }

    #[test]
    fn test_stale_marker_note_stripped_with_marker() {
        let cache = AttachmentCache::new(AttachmentCacheConfig::default());
        let earlier = format!("{} and this one?", marker_text(1, "old#1"));
        let mut request = ChatRequest::new(
            "m",
            vec![
                Message::user_blocks(vec![ContentBlock::text(earlier)]),
                Message::assistant("a dog"),
                Message::user_blocks(vec![image()]),
            ],
        );
        rewrite_to_markers(&mut request, "req", &cache);

        assert_eq!(request.messages[0].content.joined_text(), "and this one?");
        assert_eq!(count_markers(&request, NOTE_HEAD), 1);
        assert_eq!(count_markers(&request, "old#1"), 0);
    }

    #[test]
    fn test_requests_keep_their_own_images() {
        let cache = AttachmentCache::new(AttachmentCacheConfig::default());
        let picture = |data: &str| ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: "image/png".into(),
                data: data.into(),
            },
        };
        let mut first = ChatRequest::new("m", vec![Message::user_blocks(vec![picture("QUFBQQ==")])]);
        let mut second = ChatRequest::new("m", vec![Message::user_blocks(vec![picture("QkJCQg==")])]);
        rewrite_to_markers(&mut first, "req-a", &cache);
        rewrite_to_markers(&mut second, "req-b", &cache);

        assert!(second.messages[0].content.joined_text().contains("image_id \"req-b#1\""));
        assert_eq!(cache.lookup("req-a", 1).unwrap().data, "QUFBQQ==");
        assert_eq!(cache.lookup("req-b", 1).unwrap().data, "QkJCQg==");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lookup_tool_not_duplicated() {
        let cache = AttachmentCache::new(AttachmentCacheConfig::default());
        let mut request = ChatRequest::new("m", vec![Message::user_blocks(vec![image()])])
            .with_tools(vec![lookup_tool()]);
        rewrite_to_markers(&mut request, "req", &cache);
        assert_eq!(request.tools.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_invalid_image_omitted() {
        let cache = AttachmentCache::new(AttachmentCacheConfig::default());
        let bad = ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: "image/png".into(),
                data: "not base64!!".into(),
            },
        };
        let mut request = ChatRequest::new("m", vec![Message::user_blocks(vec![bad])]);
        assert_eq!(rewrite_to_markers(&mut request, "req", &cache), 0);
        assert!(cache.is_empty());
        assert!(request.tools.is_none());
    }

    #[test]
    fn test_hoist_inline_images() {
        let mut request = ChatRequest::new(
            "m",
            vec![Message::user_blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: Some(ToolResultContent::Blocks(vec![
                    ContentBlock::text("screenshot"),
                    image(),
                ])),
                is_error: None,
            }])],
        );
        hoist_inline_images(&mut request);

        let MessageContent::Blocks(blocks) = &request.messages[0].content else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert!(matches!(
            &blocks[0],
            ContentBlock::ToolResult { content: Some(ToolResultContent::Text(text)), .. } if text == "screenshot"
        ));
        assert!(matches!(blocks[1], ContentBlock::Image { .. }));
    }
}
