//! Server-sent event framing and the canonical streaming pump

pub mod pump;
pub mod sse;

pub use pump::{pump, EventStream};
pub use sse::{SseDecoder, SseFrame};
