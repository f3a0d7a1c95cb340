//! AgentRun CLI - run a prompt against any supported agent provider.

mod json_output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentrun_core::{CredentialId, Provider, ReasoningEffort, StopMode, TaskId};
use agentrun_engine::memory::{MemoryStore, MemoryTaskLog, StoreSeed};
use agentrun_engine::{AgentSpec, Engine, EngineConfig, OneShotOptions, Ports, RunContext};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::json_output::{JsonEvent, StdoutSink};

/// AgentRun CLI - multi-provider agent execution
#[derive(Parser)]
#[command(name = "agentrun")]
#[command(about = "Run prompts against coding-agent CLIs and AI APIs", long_about = None)]
struct Cli {
    /// JSON file with credentials and API providers
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AgentArgs {
    /// Provider: claude, codex, gemini, opencode, copilot, antigravity or api:<id>
    #[arg(short, long)]
    provider: Provider,

    /// Model name
    #[arg(short, long)]
    model: Option<String>,

    /// Reasoning effort: minimal, low, medium, high, xhigh
    #[arg(long)]
    effort: Option<ReasoningEffort>,

    /// Project directory the agent works in
    #[arg(long)]
    project: Option<PathBuf>,

    /// Prompt text, or "-" to read it from stdin
    prompt: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a supervised run and stream its events as JSON lines
    Run {
        #[command(flatten)]
        agent: AgentArgs,

        /// Task ID (generated when omitted)
        #[arg(short, long)]
        task: Option<String>,

        /// Append raw output to this file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Credential tried first for OAuth providers
        #[arg(long)]
        credential: Option<String>,

        /// Idle timeout in seconds (0 disables)
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Hard timeout in seconds (0 disables)
        #[arg(long)]
        hard_timeout: Option<u64>,

        /// Only use the first-ranked credential
        #[arg(long)]
        no_auto_swap: bool,
    },

    /// Ask a single question and print the answer
    Oneshot {
        #[command(flatten)]
        agent: AgentArgs,

        /// Timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Print CLI stdout untouched
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries JSON lines only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentrun=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    let ports = load_ports(cli.store.as_deref())?;

    match cli.command {
        Commands::Run {
            agent,
            task,
            log,
            credential,
            idle_timeout,
            hard_timeout,
            no_auto_swap,
        } => {
            if let Some(secs) = idle_timeout {
                config.idle_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = hard_timeout {
                config.hard_timeout = Duration::from_secs(secs);
            }
            if no_auto_swap {
                config.auto_swap = false;
            }
            let engine = Engine::new(config, ports)?;
            let task_id = task.map(TaskId::new).unwrap_or_else(TaskId::generate);
            let code = run(engine, task_id, agent, log, credential.map(CredentialId::new)).await?;
            std::process::exit(code);
        }
        Commands::Oneshot {
            agent,
            timeout,
            raw,
        } => {
            let engine = Engine::new(config, ports)?;
            let code = oneshot(engine, agent, timeout, raw).await?;
            std::process::exit(code);
        }
    }
}

fn load_ports(store: Option<&std::path::Path>) -> Result<Ports, Box<dyn std::error::Error>> {
    let seed = match store {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let seed: StoreSeed = serde_json::from_str(&contents)?;
            info!(
                path = %path.display(),
                credentials = seed.credentials.len(),
                api_providers = seed.api_providers.len(),
                "Loaded store seed"
            );
            seed
        }
        None => StoreSeed::default(),
    };

    Ok(Ports::in_memory(
        Arc::new(MemoryStore::from_seed(seed)),
        Arc::new(StdoutSink),
        Arc::new(MemoryTaskLog::new()),
    ))
}

async fn read_prompt(prompt: String) -> Result<String, Box<dyn std::error::Error>> {
    if prompt != "-" {
        return Ok(prompt);
    }
    let mut buf = String::new();
    tokio::io::stdin().read_to_string(&mut buf).await?;
    Ok(buf)
}

async fn run(
    engine: Engine,
    task_id: TaskId,
    agent: AgentArgs,
    log: Option<PathBuf>,
    credential: Option<CredentialId>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let prompt = read_prompt(agent.prompt).await?;
    let context = RunContext {
        project_path: agent.project,
        log_path: log,
        model: agent.model,
        reasoning_effort: agent.effort,
        preferred_credential: credential,
        ..RunContext::default()
    };

    let handle = engine
        .dispatch(task_id.clone(), agent.provider, prompt, context)
        .await?;
    info!(task_id = %task_id, pid = ?handle.pid(), "Run started");

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!(task_id = %task_id, "Interrupted, stopping run");
            engine.stop(&task_id, StopMode::Cancel).await;
            wait.await
        }
    };

    info!(task_id = %task_id, state = %outcome.state, exit_code = outcome.exit_code, "Run finished");
    Ok(outcome.exit_code)
}

async fn oneshot(
    engine: Engine,
    agent: AgentArgs,
    timeout: Option<u64>,
    raw: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let prompt = read_prompt(agent.prompt).await?;

    let mut spec = AgentSpec::new(agent.provider);
    if let Some(model) = agent.model {
        spec = spec.with_model(model);
    }
    if let Some(effort) = agent.effort {
        spec = spec.with_reasoning_effort(effort);
    }

    let mut options = OneShotOptions::default().with_raw_output(raw);
    if let Some(dir) = agent.project {
        options = options.with_project_path(dir);
    }
    if let Some(secs) = timeout {
        options = options.with_timeout(Duration::from_secs(secs));
    }

    let result = engine.run_one_shot(&spec, &prompt, &options).await;
    JsonEvent::new("one_shot_result", serde_json::to_value(&result)?).emit();
    Ok(if result.is_ok() { 0 } else { 1 })
}
