//! Error types for the execution engine.

use agentrun_core::{CoreError, OAuthProvider, TaskId};
use agentrun_protocol::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::ports::{CryptoError, StoreError};

/// Maximum number of bytes of an upstream error body kept in an error.
const MAX_BODY_LEN: usize = 2_000;

/// Coarse classification of why a run or an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The CLI could not be started.
    Spawn,
    /// An idle or hard timer fired.
    Timeout,
    /// A payload could not be parsed. Contained inside decoders.
    ProtocolParse,
    /// The remote side answered with a failure status or broke the stream.
    Upstream,
    /// Stopped on request.
    Cancelled,
    /// Every credential candidate failed.
    CredentialExhausted,
}

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Failed to start a child process.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The run exceeded a timeout.
    #[error("Timed out ({0} timeout)")]
    Timeout(agentrun_core::TimeoutKind),

    /// Non-success HTTP status from a provider.
    #[error("HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The provider reported an error inside a successful stream.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The run or attempt was aborted.
    #[error("Cancelled")]
    Cancelled,

    /// No credential candidate succeeded.
    #[error("All {provider} credentials failed{}", error_suffix(.last_error))]
    CredentialExhausted {
        provider: String,
        last_error: Option<String>,
    },

    /// A credential has no usable token material.
    #[error("Credential '{0}' has no usable token")]
    MissingToken(String),

    /// Unknown or disabled API provider.
    #[error("API provider '{0}' not found or disabled")]
    UnknownApiProvider(String),

    /// API provider has no model configured and none was requested.
    #[error("No model configured for API provider '{0}'")]
    NoModel(String),

    /// A run with this task id is already active.
    #[error("Task '{0}' already has an active run")]
    AlreadyRunning(TaskId),

    /// Process exited unsuccessfully.
    #[error("Process exited with code {0}")]
    ExitStatus(i32),

    /// Process was terminated by a signal.
    #[error("Process terminated by signal")]
    Signaled,

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed payload from a token endpoint.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(": {e}"))
        .unwrap_or_default()
}

impl EngineError {
    /// Build an upstream error, truncating very large bodies.
    pub fn upstream(status: u16, body: &str) -> Self {
        let mut body = body.trim().to_string();
        if body.len() > MAX_BODY_LEN {
            let mut cut = MAX_BODY_LEN;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Self::Upstream { status, body }
    }

    pub fn credential_exhausted(provider: OAuthProvider, last_error: Option<String>) -> Self {
        Self::CredentialExhausted {
            provider: provider.as_str().to_string(),
            last_error,
        }
    }

    /// Failure class used when this error ends a run.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Spawn { .. } => FailureKind::Spawn,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::CredentialExhausted { .. } => FailureKind::CredentialExhausted,
            Self::Protocol(_) => FailureKind::ProtocolParse,
            _ => FailureKind::Upstream,
        }
    }
}
