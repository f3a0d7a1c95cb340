//! AgentRun Execution Engine
//!
//! Runs a prompt against one of several AI providers and supervises the run:
//! - CLI agents (claude, codex, gemini, opencode) as child process trees
//! - OAuth providers (copilot, antigravity) over HTTP with credential failover
//! - User-configured OpenAI, Anthropic and Gemini-compatible APIs
//!
//! Output is normalized, deduplicated and broadcast while subtasks are
//! extracted from it. Persistence, encryption and fan-out are reached through
//! the traits in [`ports`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentrun_core::{OAuthProvider, Provider};
//! use agentrun_engine::memory::{MemoryStore, MemoryTaskLog, RecordingSink};
//! use agentrun_engine::{Engine, EngineConfig, Ports, RunContext};
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let ports = Ports::in_memory(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(RecordingSink::new()),
//!         Arc::new(MemoryTaskLog::new()),
//!     );
//!     let engine = Engine::new(EngineConfig::from_env()?, ports)?;
//!
//!     let handle = engine
//!         .dispatch("task-1", Provider::OAuth(OAuthProvider::Copilot), "Hello", RunContext::default())
//!         .await?;
//!     let outcome = handle.wait().await;
//!     println!("{}", outcome.state);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credentials;
mod dispatch;
mod engine;
pub mod error;
pub mod extractor;
pub mod memory;
pub mod output;
pub mod ports;
pub mod supervisor;

#[cfg(test)]
mod testing;

/// `User-Agent` sent on every outbound request.
pub(crate) const USER_AGENT: &str = concat!("agentrun/", env!("CARGO_PKG_VERSION"));

pub use config::{ConfigError, EngineConfig, Endpoints};
pub use dispatch::{cli_args, AgentSpec, OneShotOptions, OneShotResult};
pub use engine::{ApiRunRequest, CliRunRequest, Engine, HttpRunRequest, RunContext};
pub use error::{EngineError, FailureKind};
pub use ports::Ports;
pub use supervisor::{
    interrupt_process_tree, kill_process_tree, terminate_process_tree, RunHandle, RunInfo,
    RunOutcome,
};
