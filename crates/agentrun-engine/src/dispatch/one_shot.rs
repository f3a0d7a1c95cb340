//! One-shot exchanges: one prompt in, one answer out, nothing supervised.

use std::path::PathBuf;
use std::time::Duration;

use agentrun_core::{
    CliTool, CredentialId, OutputStream, Provider, ReasoningEffort, TimeoutKind,
};
use agentrun_protocol::{normalize_output, TextCollector};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::ApiRequest;
use super::cli_args;
use super::http::DeltaTarget;
use super::oauth::{run_with_failover, OAuthRequest};
use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::supervisor::{
    kill_process_tree, spawn_process, ProcessSpec, TransportEvent, TransportExit, TransportSink,
};

/// Longest stderr excerpt attached to a one-shot error.
const STDERR_EXCERPT_LEN: usize = 500;

/// Which agent answers, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub provider: Provider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Credential tried first for OAuth providers.
    #[serde(default)]
    pub credential_id: Option<CredentialId>,
}

impl AgentSpec {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model: None,
            reasoning_effort: None,
            credential_id: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn with_credential(mut self, id: impl Into<CredentialId>) -> Self {
        self.credential_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct OneShotOptions {
    /// Working directory of a CLI agent.
    pub project_path: Option<PathBuf>,
    /// Overrides the configured one-shot timeout. Zero disables it.
    pub timeout: Option<Duration>,
    /// Return CLI stdout untouched instead of the extracted answer.
    pub raw_output: bool,
}

impl OneShotOptions {
    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_raw_output(mut self, raw: bool) -> Self {
        self.raw_output = raw;
        self
    }
}

/// Answer of a one-shot exchange. `text` may be partial when `error` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OneShotResult {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OneShotResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(text: String, error: impl ToString) -> Self {
        Self {
            text,
            error: Some(error.to_string()),
        }
    }
}

pub(crate) async fn run_one_shot(
    ctx: &EngineContext,
    spec: &AgentSpec,
    prompt: &str,
    options: &OneShotOptions,
) -> OneShotResult {
    let timeout = options.timeout.unwrap_or(ctx.config.one_shot_timeout);
    info!(provider = %spec.provider, timeout_ms = timeout.as_millis() as u64, "One-shot started");

    let result = match &spec.provider {
        Provider::Cli(tool) => cli_one_shot(ctx, *tool, spec, prompt, options, timeout).await,
        _ => http_one_shot(ctx, spec, prompt, timeout).await,
    };

    match &result.error {
        None => info!(provider = %spec.provider, chars = result.text.len(), "One-shot completed"),
        Some(error) => warn!(provider = %spec.provider, error = %error, "One-shot failed"),
    }
    result
}

async fn cli_one_shot(
    ctx: &EngineContext,
    tool: CliTool,
    spec: &AgentSpec,
    prompt: &str,
    options: &OneShotOptions,
    timeout: Duration,
) -> OneShotResult {
    let args = cli_args(tool, spec.model.as_deref(), spec.reasoning_effort);
    let mut process = ProcessSpec::new(ctx.config.program_for(tool))
        .with_args(args)
        .with_stdin(prompt);
    if let Some(dir) = &options.project_path {
        process = process.with_cwd(dir);
    }

    let (tx, mut rx) = mpsc::channel(64);
    let pid = match spawn_process(process, TransportSink::new(tx)) {
        Ok(pid) => pid,
        Err(e) => return OneShotResult::failed(String::new(), e),
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    let deadline = sleep_or_forever(timeout);
    tokio::pin!(deadline);

    let exit = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(TransportEvent::Output(OutputStream::Stdout, text)) => stdout.push_str(&text),
                Some(TransportEvent::Output(OutputStream::Stderr, text)) => stderr.push_str(&text),
                Some(TransportEvent::Finished(TransportExit::Process { code })) => break Ok(code),
                Some(TransportEvent::Finished(TransportExit::Session(_))) | None => break Ok(None),
            },
            _ = &mut deadline => {
                warn!(pid, "One-shot timed out, killing process tree");
                kill_process_tree(pid).await;
                break Err(EngineError::Timeout(TimeoutKind::Hard));
            }
        }
    };

    let text = answer_text(&stdout, options.raw_output);
    match exit {
        Ok(Some(0)) => OneShotResult { text, error: None },
        Ok(code) => {
            let err = match code {
                Some(code) => EngineError::ExitStatus(code),
                None => EngineError::Signaled,
            };
            OneShotResult::failed(text, with_stderr(err.to_string(), &stderr))
        }
        Err(e) => OneShotResult::failed(text, e),
    }
}

/// The agent's answer from JSON-lines stdout, or cleaned stdout when none is found.
fn answer_text(stdout: &str, raw: bool) -> String {
    if raw {
        return stdout.to_string();
    }
    let mut collector = TextCollector::new();
    for line in stdout.lines() {
        collector.push_line(line);
    }
    let text = collector.into_text();
    if text.trim().is_empty() {
        debug!("No structured answer in output, using plain stdout");
        normalize_output(stdout).trim().to_string()
    } else {
        text
    }
}

fn with_stderr(message: String, stderr: &str) -> String {
    let stderr = normalize_output(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return message;
    }
    let mut start = stderr.len().saturating_sub(STDERR_EXCERPT_LEN);
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    format!("{message}: {}", &stderr[start..])
}

async fn http_one_shot(
    ctx: &EngineContext,
    spec: &AgentSpec,
    prompt: &str,
    timeout: Duration,
) -> OneShotResult {
    let abort = CancellationToken::new();
    let mut text = String::new();

    let outcome = {
        let mut target = DeltaTarget::Collect(&mut text);
        let exchange = http_exchange(ctx, spec, prompt, &abort, &mut target);
        if timeout.is_zero() {
            exchange.await
        } else {
            match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(TimeoutKind::Hard)),
            }
        }
    };

    match outcome {
        Ok(()) => OneShotResult { text, error: None },
        Err(e) => OneShotResult::failed(text, e),
    }
}

async fn http_exchange(
    ctx: &EngineContext,
    spec: &AgentSpec,
    prompt: &str,
    abort: &CancellationToken,
    target: &mut DeltaTarget<'_>,
) -> Result<(), EngineError> {
    match &spec.provider {
        Provider::OAuth(provider) => {
            let request = OAuthRequest {
                provider: *provider,
                prompt: prompt.to_string(),
                model: spec.model.clone(),
                preferred: spec.credential_id.clone(),
            };
            run_with_failover(ctx, &request, abort, target).await
        }
        Provider::Api(id) => {
            let request =
                ApiRequest::resolve(ctx, id, spec.model.as_deref(), prompt.to_string()).await?;
            request.stream(ctx, abort, target).await
        }
        Provider::Cli(tool) => Err(EngineError::Spawn {
            program: tool.program().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "CLI tools are not reached over HTTP",
            ),
        }),
    }
}

async fn sleep_or_forever(duration: Duration) {
    if duration.is_zero() {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, openai_sse, serve, sse_response};
    use agentrun_core::{ApiKind, ApiProvider, ApiProviderId};
    use axum::routing::post;
    use axum::Router;

    #[test]
    fn test_answer_text_prefers_final_result() {
        let stdout = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Working"}]}}"#,
            "\n",
            r#"{"type":"result","result":"Final answer"}"#,
            "\n",
        );
        assert_eq!(answer_text(stdout, false), "Final answer");
        assert_eq!(answer_text(stdout, true), stdout);
        assert_eq!(answer_text("\x1b[1mplain\x1b[0m text\n", false), "plain text");
    }

    #[test]
    fn test_stderr_excerpt_is_bounded() {
        let long = "x".repeat(2 * STDERR_EXCERPT_LEN);
        let message = with_stderr("Process exited with code 1".to_string(), &long);
        assert_eq!(message.len(), "Process exited with code 1: ".len() + STDERR_EXCERPT_LEN);
        assert_eq!(with_stderr("m".to_string(), " \n"), "m");
    }

    #[tokio::test]
    async fn test_api_one_shot_concatenates_deltas() {
        let base = serve(Router::new().route(
            "/chat/completions",
            post(|| async { sse_response(openai_sse(&["4", "2"])) }),
        ))
        .await;
        let h = harness(|_| {});
        h.store
            .insert_api_provider(ApiProvider {
                id: ApiProviderId::new("local"),
                name: "Local".to_string(),
                kind: ApiKind::OpenAi,
                base_url: base,
                api_key: None,
                models: vec!["llama3".to_string()],
                enabled: true,
            })
            .await;

        let spec = AgentSpec::new(Provider::Api(ApiProviderId::new("local")));
        let result = run_one_shot(&h.ctx, &spec, "6 * 7?", &OneShotOptions::default()).await;
        assert_eq!(result, OneShotResult { text: "42".to_string(), error: None });
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::config::EngineConfig;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        fn with_claude(config: &mut EngineConfig, program: String) {
            *config = std::mem::take(config).with_cli_program(CliTool::Claude, program);
        }

        #[tokio::test]
        async fn test_cli_one_shot_reads_prompt_and_extracts_answer() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(
                dir.path(),
                "claude",
                r#"prompt=$(cat)
printf '{"type":"result","result":"echo: %s"}\n' "$prompt""#,
            );
            let h = harness(|c| with_claude(c, program));

            let result = run_one_shot(
                &h.ctx,
                &AgentSpec::new(Provider::Cli(CliTool::Claude)),
                "ping",
                &OneShotOptions::default(),
            )
            .await;
            assert_eq!(result.error, None);
            assert_eq!(result.text, "echo: ping");
        }

        #[tokio::test]
        async fn test_cli_nonzero_exit_returns_partial_text_and_error() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(
                dir.path(),
                "claude",
                r#"cat >/dev/null
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
echo 'rate limited' >&2
exit 3"#,
            );
            let h = harness(|c| with_claude(c, program));

            let result = run_one_shot(
                &h.ctx,
                &AgentSpec::new(Provider::Cli(CliTool::Claude)),
                "ping",
                &OneShotOptions::default(),
            )
            .await;
            assert_eq!(result.text, "partial");
            assert_eq!(
                result.error.as_deref(),
                Some("Process exited with code 3: rate limited")
            );
        }

        #[tokio::test]
        async fn test_cli_timeout_kills_process() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(dir.path(), "claude", "echo started; sleep 30");
            let h = harness(|c| with_claude(c, program));

            let started = std::time::Instant::now();
            let result = run_one_shot(
                &h.ctx,
                &AgentSpec::new(Provider::Cli(CliTool::Claude)),
                "ping",
                &OneShotOptions::default().with_timeout(Duration::from_millis(300)),
            )
            .await;

            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(result.text, "started");
            assert_eq!(result.error.as_deref(), Some("Timed out (hard timeout)"));
        }
    }
}
