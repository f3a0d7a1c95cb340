//! OAuth-HTTP strategy: credential failover over a streaming chat request.

use std::sync::Arc;

use agentrun_core::{Credential, CredentialId, OAuthProvider};
use agentrun_protocol::SseDialect;
use futures_util::FutureExt;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http::{
    gemini_stream_url, join_url, stream_sse, DeltaTarget, GeminiBody, OpenAiBody, StreamStats,
};
use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::supervisor::Session;
use crate::USER_AGENT;

const COPILOT_INTEGRATION_ID: &str = "vscode-chat";

/// One OAuth exchange, independent of where its text goes.
#[derive(Debug, Clone)]
pub(crate) struct OAuthRequest {
    pub provider: OAuthProvider,
    pub prompt: String,
    /// Caller's model; falls back to the credential override, then the provider default.
    pub model: Option<String>,
    pub preferred: Option<CredentialId>,
}

impl OAuthRequest {
    /// Supervised session forwarding deltas as stdout.
    pub(crate) fn into_session(self, ctx: Arc<EngineContext>) -> Session {
        Box::new(move |abort, sink| {
            async move {
                let mut target = DeltaTarget::Run(&sink);
                run_with_failover(&ctx, &self, &abort, &mut target).await
            }
            .boxed()
        })
    }
}

/// Try candidates in pool order until one streams to completion.
///
/// With auto-swap off only the first candidate is tried. An attempt that
/// already produced output is not retried on another credential.
pub(crate) async fn run_with_failover(
    ctx: &EngineContext,
    request: &OAuthRequest,
    abort: &CancellationToken,
    target: &mut DeltaTarget<'_>,
) -> Result<(), EngineError> {
    let provider = request.provider;
    let pools = &ctx.state.pools;

    let mut candidates = pools
        .candidates(provider, request.preferred.as_ref())
        .await?;
    if !ctx.config.auto_swap {
        candidates.truncate(1);
    }
    if candidates.is_empty() {
        return Err(EngineError::credential_exhausted(
            provider,
            Some("no active credentials".to_string()),
        ));
    }

    let mut last_error = None;
    for (position, credential) in candidates.iter().enumerate() {
        if abort.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        debug!(provider = provider.as_str(), credential = %credential.id, position, "Trying credential");

        let mut stats = StreamStats::default();
        match attempt(ctx, request, credential, abort, target, &mut stats).await {
            Ok(()) => {
                let promote = ctx.config.auto_swap && position > 0;
                if let Err(e) = pools.record_success(provider, &credential.id, promote).await {
                    warn!(provider = provider.as_str(), credential = %credential.id, error = %e, "Failed to record credential success");
                }
                info!(provider = provider.as_str(), credential = %credential.id, deltas = stats.emitted, "OAuth session completed");
                return Ok(());
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = pools.record_failure(provider, &credential.id, &message).await {
                    warn!(provider = provider.as_str(), credential = %credential.id, error = %store_err, "Failed to record credential failure");
                }
                if stats.emitted > 0 {
                    return Err(e);
                }
                last_error = Some(message);
            }
        }
    }

    Err(EngineError::credential_exhausted(provider, last_error))
}

fn model_for<'a>(request: &'a OAuthRequest, credential: &'a Credential) -> &'a str {
    request
        .model
        .as_deref()
        .filter(|m| !m.is_empty())
        .or(credential.model_override.as_deref().filter(|m| !m.is_empty()))
        .unwrap_or_else(|| request.provider.default_model())
}

async fn attempt(
    ctx: &EngineContext,
    request: &OAuthRequest,
    credential: &Credential,
    abort: &CancellationToken,
    target: &mut DeltaTarget<'_>,
    stats: &mut StreamStats,
) -> Result<(), EngineError> {
    let token = tokio::select! {
        biased;
        _ = abort.cancelled() => return Err(EngineError::Cancelled),
        token = ctx.state.tokens.access_token(credential) => token?,
    };

    let model = model_for(request, credential);
    let endpoints = &ctx.config.endpoints;
    let (http_request, dialect) = match request.provider {
        OAuthProvider::Copilot => (
            ctx.http
                .post(join_url(&endpoints.copilot_api_base, "chat/completions"))
                .bearer_auth(token.expose_secret())
                .header("Copilot-Integration-Id", COPILOT_INTEGRATION_ID)
                .json(&OpenAiBody::new(model, &request.prompt)),
            SseDialect::OpenAi,
        ),
        OAuthProvider::Antigravity => (
            ctx.http
                .post(gemini_stream_url(&endpoints.antigravity_api_base, model))
                .bearer_auth(token.expose_secret())
                .json(&GeminiBody::new(&request.prompt)),
            SseDialect::Gemini,
        ),
    };
    drop(token);

    let http_request = http_request
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    stream_sse(http_request, dialect, abort, target, stats).await
}
