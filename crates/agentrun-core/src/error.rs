//! Core domain errors.

use thiserror::Error;

/// Core domain errors for AgentRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Provider name did not match any known backend.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// API provider kind did not match any supported wire format.
    #[error("Unknown API provider kind: {0}")]
    UnknownApiKind(String),

    /// Reasoning effort level not recognised.
    #[error("Unknown reasoning effort: {0}")]
    UnknownReasoningEffort(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
