//! Subtask markers embedded in free text.
//!
//! Providers without a delegation protocol are asked to announce plans inline:
//!
//! ```text
//! {"subtasks":[{"title":"Write tests"},{"title":"Update docs"}]}
//! {"subtask_done":"Write tests"}
//! ```
//!
//! Streams split those objects arbitrarily, so text accumulates in a bounded
//! buffer and every match is cut out of it once handled.

use std::sync::OnceLock;

use agentrun_core::{derive_title, SubtaskSignal, TaskId};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

/// Upper bound on buffered text, in bytes.
pub const FREE_TEXT_BUFFER_LIMIT: usize = 4 * 1024;

/// External-id namespace for plan items.
const PLAN_PREFIX: &str = "plan:";

fn plan_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\s*"subtasks"\s*:\s*\[[\s\S]*?\]\s*\}"#).expect("plan pattern is valid")
    })
}

fn done_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\s*"subtask_done"\s*:\s*"(?:[^"\\]|\\.)*"\s*\}"#)
            .expect("completion pattern is valid")
    })
}

#[derive(Debug, Deserialize)]
struct Plan {
    subtasks: Vec<PlanItem>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanItem {
    Title(String),
    Detailed {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },
}

impl PlanItem {
    fn title(&self) -> String {
        match self {
            Self::Title(title) => derive_title(Some(title), None),
            Self::Detailed {
                title,
                description,
                prompt,
            } => derive_title(
                title.as_deref().or(description.as_deref()),
                prompt.as_deref(),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Done {
    subtask_done: String,
}

/// Stable external id for a plan item title.
pub fn plan_external_id(title: &str) -> String {
    format!("{PLAN_PREFIX}{}", title.trim().to_lowercase())
}

/// Accumulates streamed text and extracts plan markers.
#[derive(Debug)]
pub struct FreeTextExtractor {
    task_id: TaskId,
    buffer: String,
}

impl FreeTextExtractor {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            buffer: String::new(),
        }
    }

    pub fn scan(&mut self, text: &str) -> Vec<SubtaskSignal> {
        self.buffer.push_str(text);

        let mut signals = Vec::new();
        loop {
            let plan = plan_pattern().find(&self.buffer).map(|m| m.range());
            let done = done_pattern().find(&self.buffer).map(|m| m.range());

            // Handle whichever marker appears first.
            let (range, is_plan) = match (plan, done) {
                (Some(p), Some(d)) if d.start < p.start => (d, false),
                (Some(p), _) => (p, true),
                (None, Some(d)) => (d, false),
                (None, None) => break,
            };

            let matched: String = self.buffer.drain(range).collect();
            if is_plan {
                self.apply_plan(&matched, &mut signals);
            } else {
                self.apply_done(&matched, &mut signals);
            }
        }

        self.trim();
        signals
    }

    fn apply_plan(&self, matched: &str, signals: &mut Vec<SubtaskSignal>) {
        match serde_json::from_str::<Plan>(matched) {
            Ok(plan) => {
                for item in plan.subtasks {
                    let title = item.title();
                    signals.push(SubtaskSignal::created(
                        self.task_id.clone(),
                        plan_external_id(&title),
                        title,
                    ));
                }
            }
            Err(e) => debug!(task_id = %self.task_id, error = %e, "Discarding malformed plan marker"),
        }
    }

    fn apply_done(&self, matched: &str, signals: &mut Vec<SubtaskSignal>) {
        match serde_json::from_str::<Done>(matched) {
            Ok(done) if !done.subtask_done.trim().is_empty() => {
                signals.push(SubtaskSignal::completed(
                    self.task_id.clone(),
                    plan_external_id(&done.subtask_done),
                ));
            }
            Ok(_) => {}
            Err(e) => debug!(task_id = %self.task_id, error = %e, "Discarding malformed completion marker"),
        }
    }

    /// Drop the oldest text beyond the buffer limit, on a char boundary.
    fn trim(&mut self) {
        if self.buffer.len() <= FREE_TEXT_BUFFER_LIMIT {
            return;
        }
        let mut cut = self.buffer.len() - FREE_TEXT_BUFFER_LIMIT;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }

    #[cfg(test)]
    fn buffered(&self) -> &str {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrun_core::SignalKind;

    #[test]
    fn test_plan_split_across_chunks_matches_once() {
        let mut extractor = FreeTextExtractor::new(TaskId::new("t"));
        assert!(extractor.scan("Here is my plan: {\"subtasks\":[{\"ti").is_empty());
        let signals = extractor.scan("tle\":\"Write tests\"}]} and then I start.");

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].external_id, "plan:write tests");
        assert_eq!(
            signals[0].kind,
            SignalKind::Created {
                title: "Write tests".to_string()
            }
        );

        // The marker was consumed; more text never rematches it.
        assert!(!extractor.buffered().contains("subtasks"));
        assert!(extractor.scan(" Working on it.").is_empty());
    }

    #[test]
    fn test_done_marker_maps_to_plan_item() {
        let mut extractor = FreeTextExtractor::new(TaskId::new("t"));
        let signals = extractor.scan(
            "{\"subtasks\":[\"Write tests\",{\"description\":\"Update docs\"}]}\nok {\"subtask_done\": \"Write Tests\"}",
        );
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[1].external_id, "plan:update docs");
        assert_eq!(signals[2].external_id, "plan:write tests");
        assert_eq!(signals[2].kind, SignalKind::Completed);
    }

    #[test]
    fn test_completion_before_plan_is_ordered() {
        let mut extractor = FreeTextExtractor::new(TaskId::new("t"));
        let signals = extractor
            .scan("{\"subtask_done\":\"A\"} {\"subtasks\":[{\"title\":\"B\"}]}");
        assert_eq!(signals[0].kind, SignalKind::Completed);
        assert!(matches!(signals[1].kind, SignalKind::Created { .. }));
    }

    #[test]
    fn test_malformed_marker_is_consumed() {
        let mut extractor = FreeTextExtractor::new(TaskId::new("t"));
        assert!(extractor.scan("{\"subtasks\":[{\"title\": }]}").is_empty());
        assert!(extractor.buffered().is_empty());
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut extractor = FreeTextExtractor::new(TaskId::new("t"));
        extractor.scan(&"é".repeat(FREE_TEXT_BUFFER_LIMIT));
        assert!(extractor.buffered().len() <= FREE_TEXT_BUFFER_LIMIT);

        let signals = extractor.scan("{\"subtasks\":[\"Late\"]}");
        assert_eq!(signals.len(), 1);
    }
}
