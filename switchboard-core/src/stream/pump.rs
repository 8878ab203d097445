//! Streaming pump
//!
//! Turns an upstream byte stream into canonical [`StreamEvent`]s: bytes are
//! framed by [`SseDecoder`], every frame is folded back through the chain, and
//! the result is decoded and yielded as soon as it is complete. Whatever way the
//! upstream ends, the caller sees exactly one `message_stop`.

use super::sse::{SseDecoder, SseFrame};
use crate::error::GatewayError;
use crate::http::ByteStream;
use crate::protocol::{ErrorBody, MessageDeltaBody, StopReason, StreamEvent};
use crate::transform::{StreamChunk, StreamState, TransformContext, TransformerChain};
use async_stream::stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::pin::Pin;
use tracing::{debug, warn};

/// Canonical events delivered to the caller
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// What the caller has been sent so far
#[derive(Debug, Default)]
struct TerminalTracker {
    started: bool,
    open_blocks: BTreeSet<usize>,
    delta_sent: bool,
    stopped: bool,
}

impl TerminalTracker {
    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { .. } => self.started = true,
            StreamEvent::ContentBlockStart { index, .. } => {
                self.open_blocks.insert(*index);
            }
            StreamEvent::ContentBlockStop { index } => {
                self.open_blocks.remove(index);
            }
            StreamEvent::MessageDelta { .. } => self.delta_sent = true,
            StreamEvent::MessageStop => self.stopped = true,
            _ => {}
        }
    }

    /// Block events are only passed on for blocks the caller saw open
    fn admits(&self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::ContentBlockDelta { index, .. } | StreamEvent::ContentBlockStop { index } => {
                self.open_blocks.contains(index)
            }
            _ => true,
        }
    }

    /// Events still owed to the caller for a well-formed ending
    fn closing_events(&mut self, stop_reason: Option<StopReason>) -> Vec<StreamEvent> {
        if self.stopped {
            return Vec::new();
        }

        let mut events: Vec<StreamEvent> = std::mem::take(&mut self.open_blocks)
            .into_iter()
            .map(|index| StreamEvent::ContentBlockStop { index })
            .collect();
        if !self.delta_sent {
            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason,
                    stop_sequence: None,
                },
                usage: None,
            });
            self.delta_sent = true;
        }
        events.push(StreamEvent::MessageStop);
        self.stopped = true;
        events
    }
}

struct Pump {
    chain: TransformerChain,
    ctx: TransformContext,
    states: Vec<StreamState>,
    decoder: SseDecoder,
    tracker: TerminalTracker,
    events_sent: usize,
}

impl Pump {
    fn new(chain: TransformerChain, ctx: TransformContext) -> Self {
        let states = chain.new_stream_states();
        Self {
            chain,
            ctx,
            states,
            decoder: SseDecoder::new(),
            tracker: TerminalTracker::default(),
            events_sent: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.tracker.stopped
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        match self.decoder.push(bytes) {
            Ok(frames) => {
                let mut events = Vec::new();
                for frame in frames {
                    if self.is_done() {
                        break;
                    }
                    if let Some(chunk) = self.decode_frame(frame) {
                        events.extend(self.on_chunk(chunk));
                    }
                }
                events
            }
            Err(error) => self.on_error(error),
        }
    }

    fn decode_frame(&self, frame: SseFrame) -> Option<StreamChunk> {
        let data = frame.data.trim();
        if data == "[DONE]" {
            return Some(StreamChunk::Done);
        }
        match serde_json::from_str::<Value>(data) {
            Ok(data) => Some(StreamChunk::Event {
                event: frame.event,
                data,
            }),
            Err(e) => {
                warn!(
                    request_id = %self.ctx.request_id,
                    provider = %self.ctx.provider,
                    error = %e,
                    "skipping undecodable stream frame"
                );
                None
            }
        }
    }

    fn on_chunk(&mut self, chunk: StreamChunk) -> Vec<StreamEvent> {
        let chunks = match self
            .chain
            .apply_stream_chunk(chunk, &self.ctx, &mut self.states)
        {
            Ok(chunks) => chunks,
            Err(error) => return self.on_error(error),
        };

        let mut events = Vec::new();
        for chunk in chunks {
            if self.is_done() {
                break;
            }
            match chunk {
                StreamChunk::Done => events.extend(self.tracker.closing_events(Some(StopReason::EndTurn))),
                StreamChunk::Event { data, .. } => {
                    match serde_json::from_value::<StreamEvent>(data) {
                        Ok(event) if !self.tracker.admits(&event) => warn!(
                            request_id = %self.ctx.request_id,
                            provider = %self.ctx.provider,
                            event = event.event_name(),
                            "dropping event for a block that is not open"
                        ),
                        Ok(event) => {
                            self.tracker.observe(&event);
                            let upstream_error = matches!(event, StreamEvent::Error { .. });
                            events.push(event);
                            if upstream_error {
                                events.extend(self.tracker.closing_events(None));
                            }
                        }
                        Err(e) => warn!(
                            request_id = %self.ctx.request_id,
                            provider = %self.ctx.provider,
                            error = %e,
                            "skipping non-canonical stream event"
                        ),
                    }
                }
            }
        }
        events
    }

    fn on_error(&mut self, error: GatewayError) -> Vec<StreamEvent> {
        warn!(
            request_id = %self.ctx.request_id,
            provider = %self.ctx.provider,
            error = %error,
            "stream failed mid-flight"
        );
        let mut events = vec![StreamEvent::Error {
            error: ErrorBody {
                kind: error.error_type().to_string(),
                message: error.to_string(),
            },
        }];
        events.extend(self.tracker.closing_events(None));
        events
    }

    /// Transport closed: flush the decoder, let every stage finish, then close
    fn on_close(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(frame) = self.decoder.finish() {
            if let Some(chunk) = self.decode_frame(frame) {
                events.extend(self.on_chunk(chunk));
            }
        }
        if !self.is_done() {
            events.extend(self.on_chunk(StreamChunk::Done));
        }
        events.extend(self.tracker.closing_events(Some(StopReason::EndTurn)));
        events
    }
}

/// Drive `body` through `chain`, yielding canonical events
pub fn pump(body: ByteStream, chain: TransformerChain, ctx: TransformContext) -> EventStream {
    let request_id = ctx.request_id;
    let mut pump = Pump::new(chain, ctx);
    let mut body = body;

    Box::pin(stream! {
        while !pump.is_done() {
            let batch = match body.next().await {
                Some(Ok(bytes)) => pump.on_bytes(&bytes),
                Some(Err(error)) => pump.on_error(error),
                None => pump.on_close(),
            };
            for event in batch {
                pump.events_sent += 1;
                yield event;
            }
        }
        debug!(request_id = %request_id, events = pump.events_sent, "stream finished");
    })
}
