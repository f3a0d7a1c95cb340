//! Generic-API-HTTP strategy: user-configured endpoints authenticated by key.

use std::sync::Arc;

use agentrun_core::{ApiKind, ApiProvider, ApiProviderId};
use agentrun_protocol::SseDialect;
use futures_util::FutureExt;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::http::{
    gemini_stream_url, join_url, stream_sse, AnthropicBody, DeltaTarget, GeminiBody, OpenAiBody,
    StreamStats,
};
use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::supervisor::Session;
use crate::USER_AGENT;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A stored provider with the model chosen for one exchange.
#[derive(Debug, Clone)]
pub(crate) struct ApiRequest {
    pub provider: ApiProvider,
    pub model: String,
    pub prompt: String,
}

impl ApiRequest {
    /// Look up an enabled provider and settle the model.
    pub(crate) async fn resolve(
        ctx: &EngineContext,
        id: &ApiProviderId,
        model: Option<&str>,
        prompt: String,
    ) -> Result<Self, EngineError> {
        let provider = ctx
            .ports
            .api_providers
            .get_api_provider(id)
            .await?
            .filter(|p| p.enabled)
            .ok_or_else(|| EngineError::UnknownApiProvider(id.to_string()))?;
        let model = provider
            .resolve_model(model)
            .map(str::to_string)
            .ok_or_else(|| EngineError::NoModel(id.to_string()))?;

        Ok(Self {
            provider,
            model,
            prompt,
        })
    }

    /// Supervised session forwarding deltas as stdout.
    pub(crate) fn into_session(self, ctx: Arc<EngineContext>) -> Session {
        Box::new(move |abort, sink| {
            async move {
                let mut target = DeltaTarget::Run(&sink);
                self.stream(&ctx, &abort, &mut target).await
            }
            .boxed()
        })
    }

    /// Send the request and forward the decoded stream.
    pub(crate) async fn stream(
        &self,
        ctx: &EngineContext,
        abort: &CancellationToken,
        target: &mut DeltaTarget<'_>,
    ) -> Result<(), EngineError> {
        let provider = &self.provider;
        let key = provider
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|sealed| ctx.ports.cipher.decrypt(sealed))
            .transpose()?;

        let base = &provider.base_url;
        let mut request = match provider.kind {
            ApiKind::OpenAi => ctx
                .http
                .post(join_url(base, "chat/completions"))
                .json(&OpenAiBody::new(&self.model, &self.prompt)),
            ApiKind::Anthropic => ctx
                .http
                .post(join_url(base, "messages"))
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&AnthropicBody::new(
                    &self.model,
                    &self.prompt,
                    ctx.config.anthropic_max_tokens,
                )),
            ApiKind::Google => ctx
                .http
                .post(gemini_stream_url(base, &self.model))
                .json(&GeminiBody::new(&self.prompt)),
        };

        if let Some(key) = &key {
            request = match provider.kind {
                ApiKind::OpenAi => request.bearer_auth(key.expose_secret()),
                ApiKind::Anthropic => request.header("x-api-key", key.expose_secret()),
                ApiKind::Google => request.header("x-goog-api-key", key.expose_secret()),
            };
        }
        drop(key);

        let request = request
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let mut stats = StreamStats::default();
        stream_sse(
            request,
            SseDialect::for_api_kind(provider.kind),
            abort,
            target,
            &mut stats,
        )
        .await?;
        info!(provider = %provider.id, model = %self.model, deltas = stats.emitted, "API session completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gemini_sse, harness, openai_sse, seal, serve, sse_response};
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    fn provider(kind: ApiKind, base: &str, models: &[&str]) -> ApiProvider {
        ApiProvider {
            id: ApiProviderId::new("p1"),
            name: "Test".to_string(),
            kind,
            base_url: base.to_string(),
            api_key: Some(seal("sk-test")),
            models: models.iter().map(|m| m.to_string()).collect(),
            enabled: true,
        }
    }

    async fn collect(h: &crate::testing::Harness, model: Option<&str>) -> Result<String, EngineError> {
        let request =
            ApiRequest::resolve(&h.ctx, &ApiProviderId::new("p1"), model, "hi".to_string()).await?;
        let mut text = String::new();
        request
            .stream(&h.ctx, &CancellationToken::new(), &mut DeltaTarget::Collect(&mut text))
            .await?;
        Ok(text)
    }

    #[tokio::test]
    async fn test_openai_kind_uses_bearer_and_first_model() {
        let base = serve(Router::new().route(
            "/v1/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["authorization"], "Bearer sk-test");
                assert_eq!(body["model"], "llama3");
                sse_response(openai_sse(&["local ", "answer"]))
            }),
        ))
        .await;
        let h = harness(|_| {});
        h.store
            .insert_api_provider(provider(ApiKind::OpenAi, &format!("{base}/v1"), &["llama3", "qwen"]))
            .await;

        assert_eq!(collect(&h, None).await.unwrap(), "local answer");
    }

    #[tokio::test]
    async fn test_anthropic_kind_headers_and_body() {
        let base = serve(Router::new().route(
            "/v1/messages",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-api-key"], "sk-test");
                assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
                assert_eq!(body["model"], "claude-sonnet-4");
                assert_eq!(body["max_tokens"], 8192);
                let frames = [
                    r#"event: message_start"#,
                    r#"data: {"type":"message_start","message":{}}"#,
                    "",
                    r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Bonjour"}}"#,
                    "",
                    r#"data: {"type":"message_stop"}"#,
                    "",
                ];
                sse_response(frames.join("\n"))
            }),
        ))
        .await;
        let h = harness(|_| {});
        h.store
            .insert_api_provider(provider(ApiKind::Anthropic, &format!("{base}/v1"), &["claude-haiku"]))
            .await;

        assert_eq!(collect(&h, Some("claude-sonnet-4")).await.unwrap(), "Bonjour");
    }

    #[tokio::test]
    async fn test_anthropic_error_event_is_an_error() {
        let base = serve(Router::new().route(
            "/v1/messages",
            post(|| async {
                let frames = [
                    r#"data: {"type":"message_start","message":{}}"#,
                    "",
                    r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hal"}}"#,
                    "",
                    "event: error",
                    r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
                    "",
                ];
                sse_response(frames.join("\n"))
            }),
        ))
        .await;
        let h = harness(|_| {});
        h.store
            .insert_api_provider(provider(ApiKind::Anthropic, &format!("{base}/v1"), &["claude-haiku"]))
            .await;

        let err = collect(&h, None).await.unwrap_err();
        assert!(matches!(&err, EngineError::Provider(m) if m == "overloaded_error: Overloaded"));
        assert_eq!(err.kind(), crate::error::FailureKind::Upstream);
    }

    #[tokio::test]
    async fn test_google_kind_puts_model_in_path() {
        let base = serve(Router::new().route(
            "/v1beta/models/:target",
            post(|Path(target): Path<String>, headers: HeaderMap| async move {
                assert_eq!(target, "gemini-2.0-flash:streamGenerateContent");
                assert_eq!(headers["x-goog-api-key"], "sk-test");
                sse_response(gemini_sse(&["a", "b"]))
            }),
        ))
        .await;
        let h = harness(|_| {});
        h.store
            .insert_api_provider(provider(
                ApiKind::Google,
                &format!("{base}/v1beta"),
                &["gemini-2.0-flash"],
            ))
            .await;

        assert_eq!(collect(&h, None).await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_unknown_disabled_and_modelless_providers() {
        let h = harness(|_| {});
        assert!(matches!(
            collect(&h, None).await,
            Err(EngineError::UnknownApiProvider(_))
        ));

        let mut disabled = provider(ApiKind::OpenAi, "http://127.0.0.1:9", &["m"]);
        disabled.enabled = false;
        h.store.insert_api_provider(disabled).await;
        assert!(matches!(
            collect(&h, None).await,
            Err(EngineError::UnknownApiProvider(_))
        ));

        h.store
            .insert_api_provider(provider(ApiKind::OpenAi, "http://127.0.0.1:9", &[]))
            .await;
        assert!(matches!(collect(&h, None).await, Err(EngineError::NoModel(_))));
    }
}
