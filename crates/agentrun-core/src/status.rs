//! Status enums for runs, subtasks and credentials.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal state of one agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Transport is live.
    #[default]
    Running,
    /// Transport closed successfully.
    Completed,
    /// Idle or hard timeout fired and the run was terminated.
    TimedOut,
    /// Stopped on request (pause or cancel).
    Aborted,
    /// Spawn failure, upstream failure, nonzero exit or credential exhaustion.
    Errored,
}

impl RunState {
    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns true if the run finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Which timer terminated a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// No output for the idle interval.
    Idle,
    /// Total run duration exceeded.
    Hard,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Hard => f.write_str("hard"),
        }
    }
}

/// Why the user stopped a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Stop now, the task is expected to resume later.
    Pause,
    /// Stop for good.
    Cancel,
}

/// Output stream of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Lifecycle of a subtask derived from agent output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Spawned, not yet reported complete.
    #[default]
    Pending,
    /// Terminal.
    Done,
}

/// Whether a credential may be handed out by the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    #[default]
    Active,
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
        assert!(RunState::Completed.is_success());
        assert!(!RunState::Errored.is_success());
    }

    #[test]
    fn test_run_state_serialization() {
        assert_eq!(
            serde_json::to_string(&RunState::TimedOut).unwrap(),
            r#""timed_out""#
        );
    }
}
