//! Wire formats consumed by AgentRun.
//!
//! - [`sse`]: Server-Sent-Events decoders for the OpenAI-compatible, Anthropic
//!   and Gemini-compatible streaming APIs. All three produce plain
//!   [`TextDelta`]s; no provider-specific JSON leaves this crate.
//! - [`cli`]: JSON-lines messages emitted by coding-agent CLIs.
//! - [`normalize`]: control-sequence stripping and spinner filtering.
//!
//! # Example
//!
//! ```rust
//! use agentrun_protocol::{SseDecoder, SseDialect};
//!
//! let mut decoder = SseDecoder::new(SseDialect::OpenAi);
//! let mut deltas = decoder.feed(b"data: {\"choices\":[{\"delta\":{\"con");
//! deltas.extend(decoder.feed(b"tent\":\"Hi\"}}]}\n\ndata: [DONE]\n\n"));
//!
//! assert_eq!(deltas.len(), 1);
//! assert_eq!(deltas[0].text, "Hi");
//! assert!(decoder.is_done());
//! ```

pub mod cli;
mod error;
pub mod normalize;
pub mod sse;

pub use cli::{ClaudeLine, CodexItem, CodexLine, ContentItem, LineText, TextCollector};
pub use error::ProtocolError;
pub use normalize::{
    is_spinner_line, normalize_output, split_incomplete_escape, strip_control_sequences,
};
pub use sse::{SseDecoder, SseDialect, SseFrame, SseLineBuffer, StreamError, TextDelta};
