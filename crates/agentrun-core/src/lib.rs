//! AgentRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Child processes or HTTP clients
//! - Persistence
//! - Runtime specifics
//!
//! Everything the execution engine and its collaborators exchange is defined here.

pub mod credential;
pub mod error;
pub mod event;
pub mod ids;
pub mod provider;
pub mod status;
pub mod subtask;

// Re-export commonly used types
pub use credential::{ApiProvider, Credential};
pub use error::CoreError;
pub use event::{EngineEvent, OutputChunk};
pub use ids::{ApiProviderId, CredentialId, SubtaskId, TaskId};
pub use provider::{ApiKind, CliTool, OAuthProvider, Provider, ReasoningEffort};
pub use status::{
    CredentialStatus, OutputStream, RunState, StopMode, SubtaskStatus, TimeoutKind,
};
pub use subtask::{derive_title, SignalKind, Subtask, SubtaskSignal};
