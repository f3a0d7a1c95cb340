//! Streaming HTTP requests shared by the OAuth and API-key strategies.

use agentrun_core::OutputStream;
use agentrun_protocol::{SseDecoder, SseDialect, TextDelta};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::supervisor::TransportSink;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// OpenAI-compatible `chat/completions` body.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

impl<'a> OpenAiBody<'a> {
    pub(crate) fn new(model: &'a str, prompt: &'a str) -> Self {
        Self {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: true,
        }
    }
}

/// Anthropic `messages` body.
#[derive(Debug, Serialize)]
pub(crate) struct AnthropicBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

impl<'a> AnthropicBody<'a> {
    pub(crate) fn new(model: &'a str, prompt: &'a str, max_tokens: u32) -> Self {
        Self {
            model,
            max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiPart<'a>>,
}

/// Gemini `streamGenerateContent` body. The model travels in the URL.
#[derive(Debug, Serialize)]
pub(crate) struct GeminiBody<'a> {
    contents: Vec<GeminiContent<'a>>,
}

impl<'a> GeminiBody<'a> {
    pub(crate) fn new(prompt: &'a str) -> Self {
        Self {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiPart { text: prompt }],
            }],
        }
    }
}

/// `{base}/models/{model}:streamGenerateContent?alt=sse`
pub(crate) fn gemini_stream_url(base: &str, model: &str) -> String {
    format!(
        "{}/models/{}:streamGenerateContent?alt=sse",
        base.trim_end_matches('/'),
        model
    )
}

/// `{base}/{path}` without doubled slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Where decoded text goes.
pub(crate) enum DeltaTarget<'a> {
    /// Forwarded to a supervised run as stdout.
    Run(&'a TransportSink),
    /// Concatenated for a one-shot answer.
    Collect(&'a mut String),
}

impl DeltaTarget<'_> {
    /// Returns false when the receiving run has gone away.
    async fn push(&mut self, text: String) -> bool {
        match self {
            Self::Run(sink) => sink.output(OutputStream::Stdout, text).await,
            Self::Collect(buffer) => {
                buffer.push_str(&text);
                true
            }
        }
    }
}

/// Running tally of one streamed attempt.
#[derive(Debug, Default)]
pub(crate) struct StreamStats {
    /// Non-empty deltas forwarded.
    pub emitted: usize,
}

/// Send `request` and forward every decoded delta to `target`.
///
/// A non-success status fails the attempt with its body. The abort token is
/// checked at every suspension point, and an aborted stream is an error.
pub(crate) async fn stream_sse(
    request: reqwest::RequestBuilder,
    dialect: SseDialect,
    abort: &CancellationToken,
    target: &mut DeltaTarget<'_>,
    stats: &mut StreamStats,
) -> Result<(), EngineError> {
    let response = tokio::select! {
        biased;
        _ = abort.cancelled() => return Err(EngineError::Cancelled),
        response = request.send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(EngineError::Cancelled),
            body = response.text() => body.unwrap_or_default(),
        };
        return Err(EngineError::upstream(status.as_u16(), &body));
    }

    let mut decoder = SseDecoder::new(dialect);
    let mut body = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(EngineError::Cancelled),
            chunk = body.next() => chunk,
        };

        let deltas = match chunk {
            Some(bytes) => decoder.feed(&bytes?),
            None => {
                let tail = decoder.finish();
                forward(tail, target, stats).await?;
                break;
            }
        };
        forward(deltas, target, stats).await?;

        if decoder.is_done() {
            break;
        }
    }

    if let Some(error) = decoder.error() {
        return Err(EngineError::Provider(error.to_string()));
    }

    debug!(
        dialect = ?dialect,
        deltas = stats.emitted,
        skipped_lines = decoder.skipped_lines(),
        "Stream finished"
    );
    Ok(())
}

async fn forward(
    deltas: Vec<TextDelta>,
    target: &mut DeltaTarget<'_>,
    stats: &mut StreamStats,
) -> Result<(), EngineError> {
    for delta in deltas {
        if delta.text.is_empty() {
            continue;
        }
        stats.emitted += 1;
        if !target.push(delta.text).await {
            return Err(EngineError::Cancelled);
        }
    }
    Ok(())
}
