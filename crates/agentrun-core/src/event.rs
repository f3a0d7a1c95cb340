//! Output chunks and the events published to the broadcast sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::TaskId;
use crate::status::{OutputStream, RunState};

/// One piece of agent output as it left the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub task_id: TaskId,
    pub stream: OutputStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputChunk {
    pub fn new(task_id: TaskId, stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            task_id,
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Events the engine publishes while runs progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Normalized agent output.
    CliOutput {
        task_id: TaskId,
        stream: OutputStream,
        data: String,
    },
    /// A subtask was created from a spawn marker.
    SubtaskCreated {
        task_id: TaskId,
        external_id: String,
        title: String,
    },
    /// A subtask reached its terminal state.
    SubtaskCompleted { task_id: TaskId, external_id: String },
    /// The run closed.
    RunFinished {
        task_id: TaskId,
        provider: String,
        state: RunState,
        exit_code: i32,
    },
}

impl EngineEvent {
    /// Event type name used on the broadcast channel.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CliOutput { .. } => "cli_output",
            Self::SubtaskCreated { .. } => "subtask_created",
            Self::SubtaskCompleted { .. } => "subtask_completed",
            Self::RunFinished { .. } => "run_finished",
        }
    }

    /// Payload without the type tag.
    pub fn payload(&self) -> Value {
        match self {
            Self::CliOutput {
                task_id,
                stream,
                data,
            } => json!({ "task_id": task_id, "stream": stream, "data": data }),
            Self::SubtaskCreated {
                task_id,
                external_id,
                title,
            } => json!({ "task_id": task_id, "external_id": external_id, "title": title }),
            Self::SubtaskCompleted {
                task_id,
                external_id,
            } => json!({ "task_id": task_id, "external_id": external_id }),
            Self::RunFinished {
                task_id,
                provider,
                state,
                exit_code,
            } => json!({
                "task_id": task_id,
                "provider": provider,
                "state": state,
                "exit_code": exit_code,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_output_payload() {
        let event = EngineEvent::CliOutput {
            task_id: TaskId::new("t1"),
            stream: OutputStream::Stderr,
            data: "warning".to_string(),
        };
        assert_eq!(event.event_type(), "cli_output");
        let payload = event.payload();
        assert_eq!(payload["stream"], "stderr");
        assert_eq!(payload["data"], "warning");
        assert!(payload.get("type").is_none());
    }

    #[test]
    fn test_event_tagged_serialization() {
        let event = EngineEvent::SubtaskCompleted {
            task_id: TaskId::new("t1"),
            external_id: "toolu_1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "subtask_completed");
    }
}
