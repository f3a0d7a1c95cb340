//! Subtasks inferred from agent output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SubtaskId, TaskId};
use crate::status::SubtaskStatus;

/// Characters of a long prompt kept as a subtask title.
pub const TITLE_PROMPT_CHARS: usize = 100;

/// Title used when a spawn marker carries neither a description nor a prompt.
pub const PLACEHOLDER_TITLE: &str = "Subtask";

/// What a signal asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalKind {
    Created { title: String },
    Completed,
}

/// A create/complete event derived from live output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSignal {
    pub task_id: TaskId,
    /// Provider-side identifier (tool-use id, item id, or plan title key).
    pub external_id: String,
    #[serde(flatten)]
    pub kind: SignalKind,
}

impl SubtaskSignal {
    pub fn created(task_id: TaskId, external_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_id,
            external_id: external_id.into(),
            kind: SignalKind::Created {
                title: title.into(),
            },
        }
    }

    pub fn completed(task_id: TaskId, external_id: impl Into<String>) -> Self {
        Self {
            task_id,
            external_id: external_id.into(),
            kind: SignalKind::Completed,
        }
    }
}

/// A subtask row as the external store sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub task_id: TaskId,
    pub external_id: String,
    pub title: String,
    pub status: SubtaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn new(task_id: TaskId, external_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: SubtaskId::generate(),
            task_id,
            external_id: external_id.into(),
            title: title.into(),
            status: SubtaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == SubtaskStatus::Done
    }

    /// Mark done. Returns false when it already was.
    pub fn complete(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        self.status = SubtaskStatus::Done;
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Title precedence: short description, else the head of the prompt, else a placeholder.
pub fn derive_title(description: Option<&str>, prompt: Option<&str>) -> String {
    if let Some(desc) = description.map(str::trim).filter(|d| !d.is_empty()) {
        return desc.to_string();
    }
    if let Some(prompt) = prompt.map(str::trim).filter(|p| !p.is_empty()) {
        return prompt.chars().take(TITLE_PROMPT_CHARS).collect();
    }
    PLACEHOLDER_TITLE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_precedence() {
        assert_eq!(derive_title(Some("Fix login"), Some("long prompt")), "Fix login");
        assert_eq!(derive_title(Some("  "), Some("Write the parser")), "Write the parser");
        assert_eq!(derive_title(None, None), PLACEHOLDER_TITLE);

        let prompt = "p".repeat(250);
        assert_eq!(derive_title(None, Some(&prompt)).len(), TITLE_PROMPT_CHARS);
    }

    #[test]
    fn test_complete_is_idempotent() {
        let mut subtask = Subtask::new(TaskId::new("t"), "toolu_1", "Write tests");
        assert!(subtask.complete());
        let first = subtask.completed_at;
        assert!(!subtask.complete());
        assert_eq!(subtask.completed_at, first);
    }

    #[test]
    fn test_signal_serialization() {
        let signal = SubtaskSignal::created(TaskId::new("t"), "toolu_1", "Write tests");
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["kind"], "created");
        assert_eq!(json["title"], "Write tests");
        assert_eq!(json["external_id"], "toolu_1");
    }
}
