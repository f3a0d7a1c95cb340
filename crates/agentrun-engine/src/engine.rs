//! The engine facade.
//!
//! [`Engine`] is cheap to clone and owns all shared state: the active-run
//! registry, the output dedup cache, the credential pools and the exchanged
//! token cache. Every run it launches is supervised in its own task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentrun_core::{
    ApiProviderId, CliTool, CredentialId, OAuthProvider, Provider, ReasoningEffort, StopMode,
    TaskId,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::credentials::{CredentialPools, TokenBroker};
use crate::dispatch::{
    cli_args, run_one_shot, AgentSpec, ApiRequest, OAuthRequest, OneShotOptions, OneShotResult,
};
use crate::error::EngineError;
use crate::output::DedupCache;
use crate::ports::Ports;
use crate::supervisor::{self, ProcessSpec, RunHandle, RunInfo, RunRegistry, RunSetup, Transport};

/// Connect timeout of the shared HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Mutable state shared by every run of one engine.
pub(crate) struct EngineState {
    pub runs: RunRegistry,
    pub dedup: Arc<DedupCache>,
    pub pools: CredentialPools,
    pub tokens: TokenBroker,
}

/// Configuration, collaborators and state, shared with supervisor tasks.
pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub ports: Ports,
    pub http: reqwest::Client,
    pub state: EngineState,
}

impl EngineContext {
    pub(crate) fn new(config: EngineConfig, ports: Ports) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let state = EngineState {
            runs: RunRegistry::default(),
            dedup: Arc::new(DedupCache::new(config.dedup_window)),
            pools: CredentialPools::new(ports.credentials.clone()),
            tokens: TokenBroker::new(
                http.clone(),
                ports.cipher.clone(),
                ports.credentials.clone(),
                config.endpoints.clone(),
            ),
        };
        Ok(Self {
            config,
            ports,
            http,
            state,
        })
    }
}

/// Launch a coding-agent CLI.
#[derive(Debug, Clone)]
pub struct CliRunRequest {
    pub task_id: TaskId,
    pub tool: CliTool,
    pub prompt: String,
    /// Working directory of the child.
    pub project_path: Option<PathBuf>,
    /// Raw output is appended here.
    pub log_path: Option<PathBuf>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl CliRunRequest {
    pub fn new(task_id: impl Into<TaskId>, tool: CliTool, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            tool,
            prompt: prompt.into(),
            project_path: None,
            log_path: None,
            model: None,
            reasoning_effort: None,
        }
    }

    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }
}

/// Launch an OAuth provider session.
#[derive(Debug, Clone)]
pub struct HttpRunRequest {
    pub task_id: TaskId,
    pub provider: OAuthProvider,
    pub prompt: String,
    pub project_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    /// Cancelling this token stops the run.
    pub cancel: CancellationToken,
    /// Identifier reported as the run's pid.
    pub pseudo_pid: Option<u32>,
    /// Credential tried first.
    pub preferred_credential: Option<CredentialId>,
}

impl HttpRunRequest {
    pub fn new(
        task_id: impl Into<TaskId>,
        provider: OAuthProvider,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            provider,
            prompt: prompt.into(),
            project_path: None,
            log_path: None,
            cancel: CancellationToken::new(),
            pseudo_pid: None,
            preferred_credential: None,
        }
    }

    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_pseudo_pid(mut self, pid: u32) -> Self {
        self.pseudo_pid = Some(pid);
        self
    }

    pub fn with_preferred_credential(mut self, id: impl Into<CredentialId>) -> Self {
        self.preferred_credential = Some(id.into());
        self
    }
}

/// Launch a session against a stored API provider.
#[derive(Debug, Clone)]
pub struct ApiRunRequest {
    pub task_id: TaskId,
    pub api_provider_id: ApiProviderId,
    /// Falls back to the provider's first model.
    pub model: Option<String>,
    pub prompt: String,
    pub project_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub cancel: CancellationToken,
    pub pseudo_pid: Option<u32>,
}

impl ApiRunRequest {
    pub fn new(
        task_id: impl Into<TaskId>,
        api_provider_id: impl Into<ApiProviderId>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            api_provider_id: api_provider_id.into(),
            model: None,
            prompt: prompt.into(),
            project_path: None,
            log_path: None,
            cancel: CancellationToken::new(),
            pseudo_pid: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_pseudo_pid(mut self, pid: u32) -> Self {
        self.pseudo_pid = Some(pid);
        self
    }
}

/// Provider-independent options for [`Engine::dispatch`]. Fields that do not
/// apply to the chosen provider are ignored.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub project_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub preferred_credential: Option<CredentialId>,
    pub cancel: Option<CancellationToken>,
    pub pseudo_pid: Option<u32>,
}

/// Multi-provider agent execution engine.
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<EngineContext>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, ports: Ports) -> Result<Self, EngineError> {
        Ok(Self::from_context(Arc::new(EngineContext::new(config, ports)?)))
    }

    pub(crate) fn from_context(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Start a CLI agent as a supervised child process.
    pub async fn spawn_cli_agent(&self, request: CliRunRequest) -> Result<RunHandle, EngineError> {
        let CliRunRequest {
            task_id,
            tool,
            prompt,
            project_path,
            log_path,
            model,
            reasoning_effort,
        } = request;

        let program = self.ctx.config.program_for(tool);
        let args = cli_args(tool, model.as_deref(), reasoning_effort);
        let mut spec = ProcessSpec::new(program)
            .with_args(args)
            .with_stdin(prompt.clone());
        if let Some(dir) = project_path {
            spec = spec.with_cwd(dir);
        }

        info!(task_id = %task_id, program = %program, model = model.as_deref().unwrap_or("default"), "Spawning CLI agent");
        supervisor::launch(
            &self.ctx,
            RunSetup {
                task_id,
                provider: Provider::Cli(tool),
                prompt,
                log_path,
                pseudo_pid: None,
                cancel: CancellationToken::new(),
            },
            Transport::Process(spec),
        )
        .await
    }

    /// Start an OAuth provider session with credential failover.
    pub async fn launch_http_agent(
        &self,
        request: HttpRunRequest,
    ) -> Result<RunHandle, EngineError> {
        self.launch_oauth(request, None).await
    }

    async fn launch_oauth(
        &self,
        request: HttpRunRequest,
        model: Option<String>,
    ) -> Result<RunHandle, EngineError> {
        let HttpRunRequest {
            task_id,
            provider,
            prompt,
            project_path,
            log_path,
            cancel,
            pseudo_pid,
            preferred_credential,
        } = request;

        info!(
            task_id = %task_id,
            provider = provider.as_str(),
            project = ?project_path,
            "Launching OAuth agent"
        );
        let session = OAuthRequest {
            provider,
            prompt: prompt.clone(),
            model,
            preferred: preferred_credential,
        }
        .into_session(self.ctx.clone());

        supervisor::launch(
            &self.ctx,
            RunSetup {
                task_id,
                provider: Provider::OAuth(provider),
                prompt,
                log_path,
                pseudo_pid,
                cancel,
            },
            Transport::Session(session),
        )
        .await
    }

    /// Start a session against a stored API provider.
    ///
    /// Fails immediately when the provider is unknown, disabled, or has no model.
    pub async fn launch_api_provider_agent(
        &self,
        request: ApiRunRequest,
    ) -> Result<RunHandle, EngineError> {
        let ApiRunRequest {
            task_id,
            api_provider_id,
            model,
            prompt,
            project_path,
            log_path,
            cancel,
            pseudo_pid,
        } = request;

        let api = ApiRequest::resolve(&self.ctx, &api_provider_id, model.as_deref(), prompt.clone())
            .await?;
        info!(
            task_id = %task_id,
            provider = %api_provider_id,
            model = %api.model,
            project = ?project_path,
            "Launching API agent"
        );
        let session = api.into_session(self.ctx.clone());

        supervisor::launch(
            &self.ctx,
            RunSetup {
                task_id,
                provider: Provider::Api(api_provider_id),
                prompt,
                log_path,
                pseudo_pid,
                cancel,
            },
            Transport::Session(session),
        )
        .await
    }

    /// Launch `prompt` on whichever strategy `provider` calls for.
    pub async fn dispatch(
        &self,
        task_id: impl Into<TaskId>,
        provider: Provider,
        prompt: impl Into<String>,
        context: RunContext,
    ) -> Result<RunHandle, EngineError> {
        let task_id = task_id.into();
        let prompt = prompt.into();
        let RunContext {
            project_path,
            log_path,
            model,
            reasoning_effort,
            preferred_credential,
            cancel,
            pseudo_pid,
        } = context;
        let cancel = cancel.unwrap_or_default();

        match provider {
            Provider::Cli(tool) => {
                self.spawn_cli_agent(CliRunRequest {
                    task_id,
                    tool,
                    prompt,
                    project_path,
                    log_path,
                    model,
                    reasoning_effort,
                })
                .await
            }
            Provider::OAuth(provider) => {
                let request = HttpRunRequest {
                    task_id,
                    provider,
                    prompt,
                    project_path,
                    log_path,
                    cancel,
                    pseudo_pid,
                    preferred_credential,
                };
                self.launch_oauth(request, model).await
            }
            Provider::Api(api_provider_id) => {
                self.launch_api_provider_agent(ApiRunRequest {
                    task_id,
                    api_provider_id,
                    model,
                    prompt,
                    project_path,
                    log_path,
                    cancel,
                    pseudo_pid,
                })
                .await
            }
        }
    }

    /// Ask one question and wait for the answer. Never supervised or registered.
    pub async fn run_one_shot(
        &self,
        spec: &AgentSpec,
        prompt: &str,
        options: &OneShotOptions,
    ) -> OneShotResult {
        run_one_shot(&self.ctx, spec, prompt, options).await
    }

    /// Stop the active run of a task. Returns false when there is none or it
    /// is already stopping.
    pub async fn stop(&self, task_id: &TaskId, mode: StopMode) -> bool {
        let stopped = self.ctx.state.runs.stop(task_id, mode).await;
        if stopped {
            info!(task_id = %task_id, mode = ?mode, "Stop requested");
        }
        stopped
    }

    /// Runs currently supervised, oldest first.
    pub async fn active_runs(&self) -> Vec<RunInfo> {
        self.ctx.state.runs.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::plan_external_id;
    use crate::testing::{harness, openai_sse, serve, sse_response};
    use agentrun_core::{ApiKind, ApiProvider, RunState};
    use axum::body::Body;
    use axum::routing::post;
    use axum::Router;
    use futures_util::StreamExt;

    fn local_provider(base: String) -> ApiProvider {
        ApiProvider {
            id: ApiProviderId::new("local"),
            name: "Local".to_string(),
            kind: ApiKind::OpenAi,
            base_url: base,
            api_key: None,
            models: vec!["llama3".to_string()],
            enabled: true,
        }
    }

    /// Chat endpoint whose stream opens with `first` and then never ends.
    async fn hanging_server(first: &'static str) -> String {
        serve(Router::new().route(
            "/chat/completions",
            post(move || async move {
                let head = openai_sse(&[first]).replace("data: [DONE]\n\n", "");
                let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(head) })
                    .chain(futures_util::stream::pending());
                sse_response(Body::from_stream(stream))
            }),
        ))
        .await
    }

    #[tokio::test]
    async fn test_api_run_streams_plan_into_subtask() {
        let base = serve(Router::new().route(
            "/chat/completions",
            post(|| async {
                sse_response(openai_sse(&[
                    "Plan:\n{\"subtasks\": [",
                    "\"Write tests\"]}\n",
                    "Working on it\n",
                ]))
            }),
        ))
        .await;
        let h = harness(|_| {});
        h.store.insert_api_provider(local_provider(base)).await;
        let log_path = h.dir.path().join("logs/t1.log");

        let handle = h
            .engine()
            .launch_api_provider_agent(
                ApiRunRequest::new("t1", "local", "Plan the work").with_log_path(&log_path),
            )
            .await
            .unwrap();
        let outcome = handle.wait().await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.provider, "api:local");

        let created = h.sink.of_type("subtask_created");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["title"], "Write tests");
        assert_eq!(created[0]["external_id"], plan_external_id("Write tests"));

        let logged = std::fs::read_to_string(&log_path).unwrap();
        assert!(logged.contains("Working on it"));
        assert_eq!(h.sink.of_type("run_finished").len(), 1);
        assert!(h.engine().active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_active_runs() {
        let base = hanging_server("thinking").await;
        let h = harness(|_| {});
        h.store.insert_api_provider(local_provider(base)).await;
        let engine = h.engine();

        let handle = engine
            .launch_api_provider_agent(ApiRunRequest::new("t1", "local", "go").with_pseudo_pid(4242))
            .await
            .unwrap();

        let runs = engine.active_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].provider, "api:local");
        assert_eq!(runs[0].pid, Some(4242));

        let task = TaskId::new("t1");
        assert!(engine.stop(&task, StopMode::Cancel).await);
        assert!(!engine.stop(&task, StopMode::Cancel).await);

        let outcome = handle.wait().await;
        assert_eq!(outcome.state, RunState::Aborted);
        assert!(!engine.stop(&task, StopMode::Cancel).await);
        assert_eq!(h.log.entries().await[0].message, "[local] Aborted by user");
        assert_eq!(h.hook.outcomes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_caller_cancel_token_stops_http_run() {
        let base = hanging_server("partial").await;
        let h = harness(|_| {});
        h.store.insert_api_provider(local_provider(base)).await;

        let cancel = CancellationToken::new();
        let handle = h
            .engine()
            .launch_api_provider_agent(
                ApiRunRequest::new("t1", "local", "go").with_cancel_token(cancel.clone()),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(outcome.state, RunState::Aborted);
        assert!(h
            .sink
            .of_type("cli_output")
            .iter()
            .any(|e| e["data"] == "partial"));
    }

    #[tokio::test]
    async fn test_error_event_mid_stream_fails_run() {
        let base = serve(Router::new().route(
            "/chat/completions",
            post(|| async {
                let head = openai_sse(&["partial "]).replace("data: [DONE]\n\n", "");
                sse_response(format!(
                    "{head}data: {{\"error\":{{\"message\":\"Rate limit reached\",\"type\":\"rate_limit_exceeded\"}}}}\n\n"
                ))
            }),
        ))
        .await;
        let h = harness(|_| {});
        h.store.insert_api_provider(local_provider(base)).await;

        let handle = h
            .engine()
            .launch_api_provider_agent(ApiRunRequest::new("t1", "local", "go"))
            .await
            .unwrap();
        let outcome = handle.wait().await;

        assert_eq!(outcome.state, RunState::Errored);
        assert_ne!(outcome.exit_code, 0);
        assert_eq!(
            h.log.entries().await[0].message,
            "[local] Error: Provider error: rate_limit_exceeded: Rate limit reached"
        );
    }

    #[tokio::test]
    async fn test_exhausted_oauth_run_is_errored() {
        let h = harness(|_| {});
        let handle = h
            .engine()
            .dispatch("t1", Provider::OAuth(OAuthProvider::Copilot), "go", RunContext::default())
            .await
            .unwrap();
        let outcome = handle.wait().await;

        assert_eq!(outcome.state, RunState::Errored);
        assert_eq!(
            h.log.entries().await[0].message,
            "[copilot] Error: All copilot credentials failed: no active credentials"
        );
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unknown_api_provider() {
        let h = harness(|_| {});
        let err = h
            .engine()
            .dispatch(
                "t1",
                Provider::Api(ApiProviderId::new("missing")),
                "go",
                RunContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownApiProvider(_)));
        assert!(h.engine().active_runs().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_run_records_delegated_subtask() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("claude");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "cat >/dev/null\n",
                r#"echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Task","input":{"description":"Write tests","prompt":"Write unit tests"}}]}}'"#,
                "\n",
                r#"echo '{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"done"}]}}'"#,
                "\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let program = script.display().to_string();
        let h = harness(|c| {
            c.cli_programs.insert(CliTool::Claude, program);
        });
        let handle = h
            .engine()
            .spawn_cli_agent(CliRunRequest::new("t1", CliTool::Claude, "Delegate").with_project_path(dir.path()))
            .await
            .unwrap();
        assert!(handle.pid().is_some());
        let outcome = handle.wait().await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(h.sink.of_type("subtask_created").len(), 1);
        assert_eq!(h.sink.of_type("subtask_completed").len(), 1);
        let subtasks = h.store.subtasks_of(&TaskId::new("t1")).await;
        assert_eq!(subtasks[0].external_id, "toolu_1");
        assert!(subtasks[0].is_done());
    }
}
