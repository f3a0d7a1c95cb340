//! Server-Sent-Events decoding.
//!
//! Bytes arrive in arbitrary slices. [`SseLineBuffer`] keeps the incomplete
//! trailing line (as bytes, so a UTF-8 sequence split across reads survives)
//! and yields `data:` frames; [`SseDecoder`] turns frames into text deltas for
//! one [`SseDialect`].

use agentrun_core::ApiKind;
use serde_json::Value;
use tracing::{debug, trace};

/// Stream terminator sent by OpenAI-compatible servers.
const DONE_TOKEN: &str = "[DONE]";

/// Which provider schema the `data:` payloads follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SseDialect {
    /// `choices[0].delta.content`
    OpenAi,
    /// `content_block_delta` events carrying `delta.text`
    Anthropic,
    /// `candidates[].content.parts[].text`
    Gemini,
}

impl SseDialect {
    /// Decoder matching a stored API provider kind.
    pub fn for_api_kind(kind: ApiKind) -> Self {
        match kind {
            ApiKind::OpenAi => Self::OpenAi,
            ApiKind::Anthropic => Self::Anthropic,
            ApiKind::Google => Self::Gemini,
        }
    }

    /// Pull the text fragments out of one decoded payload.
    fn extract(&self, payload: &Value) -> Vec<String> {
        match self {
            Self::OpenAi => payload
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .map(|s| vec![s.to_string()])
                .unwrap_or_default(),
            Self::Anthropic => {
                if payload.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                    return Vec::new();
                }
                payload
                    .pointer("/delta/text")
                    .and_then(Value::as_str)
                    .map(|s| vec![s.to_string()])
                    .unwrap_or_default()
            }
            Self::Gemini => {
                // Code Assist style endpoints wrap the generateContent reply in `response`.
                let body = payload.get("response").unwrap_or(payload);
                let Some(candidates) = body.get("candidates").and_then(Value::as_array) else {
                    return Vec::new();
                };
                candidates
                    .iter()
                    .filter_map(|c| c.pointer("/content/parts").and_then(Value::as_array))
                    .flatten()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            }
        }
    }
}

/// Failure reported by the provider inside an otherwise successful stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    /// Provider error type or status, e.g. `overloaded_error`.
    pub kind: Option<String>,
    pub message: String,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{kind}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl StreamError {
    /// Recognize an error payload. Every dialect carries it under `error`,
    /// either as an object with `message` or as a plain string.
    fn from_payload(payload: &Value) -> Option<Self> {
        let error = payload
            .get("error")
            .or_else(|| payload.pointer("/response/error"))
            .filter(|e| !e.is_null())?;

        if let Some(message) = error.as_str() {
            return Some(Self {
                kind: None,
                message: message.to_string(),
            });
        }
        let field = |key: &str| error.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            kind: field("type").or_else(|| field("status")).or_else(|| field("code")),
            message: field("message").unwrap_or_else(|| error.to_string()),
        })
    }
}

/// A normalized unit of streamed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub text: String,
}

/// One meaningful SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Payload following `data:`.
    Data(String),
    /// The literal terminator; no payload.
    Done,
}

/// Splits a byte stream into SSE lines across read boundaries.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(frame) = parse_line(&self.pending[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        frames
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let rest = std::mem::take(&mut self.pending);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let line = text.strip_suffix('\r').unwrap_or(text.as_ref());

    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    if data.trim() == DONE_TOKEN {
        return Some(SseFrame::Done);
    }
    Some(SseFrame::Data(data.to_string()))
}

/// Stateful decoder for one response body.
#[derive(Debug)]
pub struct SseDecoder {
    dialect: SseDialect,
    lines: SseLineBuffer,
    done: bool,
    skipped: u64,
    error: Option<StreamError>,
}

impl SseDecoder {
    pub fn new(dialect: SseDialect) -> Self {
        Self {
            dialect,
            lines: SseLineBuffer::new(),
            done: false,
            skipped: 0,
            error: None,
        }
    }

    pub fn dialect(&self) -> SseDialect {
        self.dialect
    }

    /// Whether the terminator or an error has been seen. Later bytes are ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Error event that ended the stream, if any. Deltas decoded before it
    /// are still returned.
    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    /// Number of data lines dropped because they were not usable JSON.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped
    }

    /// Feed one read's worth of bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<TextDelta> {
        if self.done {
            return Vec::new();
        }
        let frames = self.lines.push(bytes);
        self.decode(frames)
    }

    /// Drain whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<TextDelta> {
        if self.done {
            return Vec::new();
        }
        let frames = self.lines.finish();
        self.decode(frames)
    }

    fn decode(&mut self, frames: Vec<SseFrame>) -> Vec<TextDelta> {
        let mut deltas = Vec::new();
        for frame in frames {
            match frame {
                SseFrame::Done => {
                    trace!(dialect = ?self.dialect, "SSE stream terminator");
                    self.done = true;
                    break;
                }
                SseFrame::Data(data) => match serde_json::from_str::<Value>(&data) {
                    Ok(payload) => {
                        if let Some(error) = StreamError::from_payload(&payload) {
                            debug!(dialect = ?self.dialect, error = %error, "SSE error event");
                            self.error = Some(error);
                            self.done = true;
                            break;
                        }
                        deltas.extend(
                            self.dialect
                                .extract(&payload)
                                .into_iter()
                                .filter(|t| !t.is_empty())
                                .map(|text| TextDelta { text }),
                        );
                    }
                    Err(e) => {
                        self.skipped += 1;
                        let preview: String = data.chars().take(120).collect();
                        debug!(error = %e, preview = %preview, "Skipping unparseable SSE line");
                    }
                },
            }
        }
        deltas
    }
}
