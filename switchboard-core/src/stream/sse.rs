//! Incremental server-sent-event decoding
//!
//! Bytes are buffered until a blank line closes an event, so a frame is never
//! split across UTF-8 sequences or JSON payloads.

use crate::error::{GatewayError, GatewayResult, NetworkErrorKind};

/// Guard against unbounded buffer growth from a malformed upstream
const MAX_SSE_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// One complete event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no event boundary
    scanned: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by them
    pub fn push(&mut self, bytes: &[u8]) -> GatewayResult<Vec<SseFrame>> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        let mut consumed = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = find_boundary(&self.buffer[cursor..]) {
            let end = cursor + offset;
            if let Some(frame) = parse_frame(&self.buffer[consumed..end]) {
                frames.push(frame);
            }
            consumed = end + 2;
            cursor = consumed;
        }
        self.buffer.drain(..consumed);
        // the last byte may be the first half of a boundary
        self.scanned = self.buffer.len().saturating_sub(1);

        if self.buffer.len() > MAX_SSE_BUFFER_SIZE {
            return Err(GatewayError::Network {
                kind: NetworkErrorKind::Body,
                message: format!(
                    "SSE event exceeded maximum size ({} bytes)",
                    MAX_SSE_BUFFER_SIZE
                ),
            });
        }
        Ok(frames)
    }

    /// Flush a trailing event that was not closed by a blank line
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.scanned = 0;
        let raw = std::mem::take(&mut self.buffer);
        parse_frame(&raw)
    }
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_pushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: message_start\nda").unwrap().is_empty());
        let frames = decoder.push(b"ta: {\"a\":1}\n\ndata: [DONE]\n\n").unwrap();
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("message_start".into()),
                    data: "{\"a\":1}".into()
                },
                SseFrame {
                    event: None,
                    data: "[DONE]".into()
                },
            ]
        );
    }

    #[test]
    fn test_multibyte_split() {
        let payload = "data: {\"t\":\"héllo\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).unwrap().is_empty());
        let frames = decoder.push(&payload[split..]).unwrap();
        assert_eq!(frames[0].data, "{\"t\":\"héllo\"}");
    }

    #[test]
    fn test_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\r\n\r\ndata: {}\r\n\r\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn test_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: a\ndata: b\n\n").unwrap();
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn test_boundary_split_between_pushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: one\n").unwrap().is_empty());
        let frames = decoder.push(b"\ndata: two\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "one");
        assert_eq!(decoder.push(b"\n").unwrap()[0].data, "two");
    }

    #[test]
    fn test_large_chunk_of_small_frames_accepted() {
        let frame = b"data: {\"type\":\"ping\"}\n\n";
        let chunk = frame.repeat(MAX_SSE_BUFFER_SIZE / frame.len() + 1000);
        assert!(chunk.len() > MAX_SSE_BUFFER_SIZE);

        let mut decoder = SseDecoder::new();
        let frames = decoder.push(&chunk).unwrap();
        assert_eq!(frames.len(), chunk.len() / frame.len());
    }

    #[test]
    fn test_oversized_event_rejected() {
        let mut decoder = SseDecoder::new();
        let mut chunk = b"data: ".to_vec();
        chunk.resize(MAX_SSE_BUFFER_SIZE + 1, b'x');
        assert!(matches!(
            decoder.push(&chunk),
            Err(GatewayError::Network {
                kind: NetworkErrorKind::Body,
                ..
            })
        ));
    }

    #[test]
    fn test_finish_flushes_trailing_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"x\":1}").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap().data, "{\"x\":1}");
        assert!(decoder.finish().is_none());
    }
}
