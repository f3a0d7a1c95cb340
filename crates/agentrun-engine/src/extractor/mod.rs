//! Subtask extraction from live agent output.
//!
//! One [`SubtaskExtractor`] lives per run and is dropped with it. It only
//! produces [`SubtaskSignal`]s; [`SubtaskRecorder`] applies them against the
//! store so repeats stay no-ops.

mod freetext;
mod recorder;
mod structured;

pub use freetext::{plan_external_id, FreeTextExtractor, FREE_TEXT_BUFFER_LIMIT};
pub use recorder::SubtaskRecorder;
pub use structured::{ClaudeExtractor, CodexExtractor};

use agentrun_core::{CliTool, Provider, SubtaskSignal, TaskId};

/// Extraction mode chosen from the provider.
#[derive(Debug)]
pub enum SubtaskExtractor {
    Claude(ClaudeExtractor),
    Codex(CodexExtractor),
    FreeText(FreeTextExtractor),
}

impl SubtaskExtractor {
    /// claude and codex have a delegation dialect; everything else uses free text.
    pub fn for_provider(task_id: TaskId, provider: &Provider) -> Self {
        match provider {
            Provider::Cli(CliTool::Claude) => Self::Claude(ClaudeExtractor::new(task_id)),
            Provider::Cli(CliTool::Codex) => Self::Codex(CodexExtractor::new(task_id)),
            _ => Self::FreeText(FreeTextExtractor::new(task_id)),
        }
    }

    pub fn scan(&mut self, text: &str) -> Vec<SubtaskSignal> {
        match self {
            Self::Claude(e) => e.scan(text),
            Self::Codex(e) => e.scan(text),
            Self::FreeText(e) => e.scan(text),
        }
    }

    /// Handle a trailing line without a newline once the stream has ended.
    pub fn finish(&mut self) -> Vec<SubtaskSignal> {
        match self {
            Self::Claude(e) => e.finish(),
            Self::Codex(e) => e.finish(),
            Self::FreeText(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrun_core::{ApiProviderId, OAuthProvider};

    #[test]
    fn test_mode_per_provider() {
        let task = TaskId::new("t");
        assert!(matches!(
            SubtaskExtractor::for_provider(task.clone(), &Provider::Cli(CliTool::Claude)),
            SubtaskExtractor::Claude(_)
        ));
        assert!(matches!(
            SubtaskExtractor::for_provider(task.clone(), &Provider::Cli(CliTool::Codex)),
            SubtaskExtractor::Codex(_)
        ));
        assert!(matches!(
            SubtaskExtractor::for_provider(task.clone(), &Provider::Cli(CliTool::Gemini)),
            SubtaskExtractor::FreeText(_)
        ));
        assert!(matches!(
            SubtaskExtractor::for_provider(task.clone(), &Provider::OAuth(OAuthProvider::Copilot)),
            SubtaskExtractor::FreeText(_)
        ));
        assert!(matches!(
            SubtaskExtractor::for_provider(task, &Provider::Api(ApiProviderId::new("p"))),
            SubtaskExtractor::FreeText(_)
        ));
    }
}
