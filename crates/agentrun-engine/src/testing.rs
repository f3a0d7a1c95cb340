//! Fixtures shared by unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineContext};
use crate::memory::{Base64Cipher, MemoryStore, MemoryTaskLog, RecordingSink};
use crate::ports::{Cipher, CompletionHook, Ports};
use crate::supervisor::RunOutcome;

/// Serve `app` on an ephemeral loopback port and return its base URL.
pub(crate) async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// `text/event-stream` response with a fixed body.
pub(crate) fn sse_response(body: impl Into<Body>) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body.into())
        .unwrap()
}

/// OpenAI-style SSE body carrying `parts`, terminated by `[DONE]`.
pub(crate) fn openai_sse(parts: &[&str]) -> String {
    let mut body = String::new();
    for part in parts {
        let frame = serde_json::json!({ "choices": [{ "delta": { "content": part } }] });
        body.push_str(&format!("data: {frame}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Gemini-style SSE body carrying `parts`.
pub(crate) fn gemini_sse(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| {
            let frame = serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": part }] } }]
            });
            format!("data: {frame}\r\n\r\n")
        })
        .collect()
}

/// Value as stored by the in-memory cipher.
pub(crate) fn seal(plain: &str) -> String {
    Base64Cipher.encrypt(plain).unwrap()
}

/// Completion hook that keeps every outcome.
#[derive(Debug, Default)]
pub(crate) struct RecordingCompletion {
    outcomes: Mutex<Vec<RunOutcome>>,
}

impl RecordingCompletion {
    pub(crate) async fn outcomes(&self) -> Vec<RunOutcome> {
        self.outcomes.lock().await.clone()
    }
}

#[async_trait]
impl CompletionHook for RecordingCompletion {
    async fn on_complete(&self, outcome: &RunOutcome) {
        self.outcomes.lock().await.push(outcome.clone());
    }
}

/// An engine context wired to in-memory ports, plus handles on those ports.
pub(crate) struct Harness {
    pub ctx: Arc<EngineContext>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub log: Arc<MemoryTaskLog>,
    pub hook: Arc<RecordingCompletion>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub(crate) fn engine(&self) -> Engine {
        Engine::from_context(self.ctx.clone())
    }
}

pub(crate) fn harness(configure: impl FnOnce(&mut EngineConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig {
        prompt_dir: dir.path().join("prompts"),
        ..EngineConfig::default()
    };
    configure(&mut config);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    let log = Arc::new(MemoryTaskLog::new());
    let hook = Arc::new(RecordingCompletion::default());
    let ports = Ports::in_memory(store.clone(), sink.clone(), log.clone())
        .with_completion(hook.clone());
    let ctx = Arc::new(EngineContext::new(config, ports).unwrap());

    Harness {
        ctx,
        store,
        sink,
        log,
        hook,
        dir,
    }
}
