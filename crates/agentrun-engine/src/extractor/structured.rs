//! Sub-agent markers in structured JSON-lines output.

use std::collections::{HashMap, HashSet};

use agentrun_core::{derive_title, SubtaskSignal, TaskId};
use agentrun_protocol::{ClaudeLine, CodexItem, CodexLine, ContentItem};
use serde_json::Value;
use tracing::trace;

/// Tool names that claude uses to delegate to a sub-agent.
const CLAUDE_DELEGATION_TOOLS: &[&str] = &["Task", "Agent"];

/// Reassembles complete lines from arbitrarily split chunks.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: String,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// `Task`/`Agent` tool calls in claude `stream-json` output.
#[derive(Debug)]
pub struct ClaudeExtractor {
    task_id: TaskId,
    lines: LineSplitter,
    spawned: HashSet<String>,
}

impl ClaudeExtractor {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            lines: LineSplitter::default(),
            spawned: HashSet::new(),
        }
    }

    pub fn scan(&mut self, text: &str) -> Vec<SubtaskSignal> {
        let lines = self.lines.push(text);
        lines.iter().flat_map(|l| self.scan_line(l)).collect()
    }

    pub fn finish(&mut self) -> Vec<SubtaskSignal> {
        match self.lines.finish() {
            Some(line) => self.scan_line(&line),
            None => Vec::new(),
        }
    }

    fn scan_line(&mut self, line: &str) -> Vec<SubtaskSignal> {
        if !line.starts_with('{') {
            return Vec::new();
        }
        let Ok(parsed) = serde_json::from_str::<ClaudeLine>(line) else {
            trace!(task_id = %self.task_id, "Ignoring non-message line");
            return Vec::new();
        };

        let mut signals = Vec::new();
        match parsed {
            ClaudeLine::Assistant { message } => {
                for item in message.items() {
                    if let ContentItem::ToolUse { id, name, input } = item {
                        if !CLAUDE_DELEGATION_TOOLS.contains(&name.as_str()) {
                            continue;
                        }
                        let title = derive_title(
                            input.get("description").and_then(Value::as_str),
                            input.get("prompt").and_then(Value::as_str),
                        );
                        self.spawned.insert(id.clone());
                        signals.push(SubtaskSignal::created(self.task_id.clone(), id, title));
                    }
                }
            }
            ClaudeLine::User { message } => {
                for item in message.items() {
                    if let ContentItem::ToolResult { tool_use_id, .. } = item {
                        if self.spawned.contains(tool_use_id) {
                            signals.push(SubtaskSignal::completed(
                                self.task_id.clone(),
                                tool_use_id,
                            ));
                        }
                    }
                }
            }
            _ => {}
        }
        signals
    }
}

/// Collab tool calls in `codex exec --json` output.
#[derive(Debug)]
pub struct CodexExtractor {
    task_id: TaskId,
    lines: LineSplitter,
    spawned: HashSet<String>,
    /// Child thread id to the spawning item id.
    threads: HashMap<String, String>,
}

impl CodexExtractor {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            lines: LineSplitter::default(),
            spawned: HashSet::new(),
            threads: HashMap::new(),
        }
    }

    pub fn scan(&mut self, text: &str) -> Vec<SubtaskSignal> {
        let lines = self.lines.push(text);
        lines.iter().flat_map(|l| self.scan_line(l)).collect()
    }

    pub fn finish(&mut self) -> Vec<SubtaskSignal> {
        match self.lines.finish() {
            Some(line) => self.scan_line(&line),
            None => Vec::new(),
        }
    }

    fn created(&mut self, item: &CodexItem) -> Option<SubtaskSignal> {
        if !self.spawned.insert(item.id.clone()) {
            return None;
        }
        let title = derive_title(item.description.as_deref(), item.prompt.as_deref());
        Some(SubtaskSignal::created(self.task_id.clone(), &item.id, title))
    }

    fn scan_line(&mut self, line: &str) -> Vec<SubtaskSignal> {
        if !line.starts_with('{') {
            return Vec::new();
        }
        let Ok(parsed) = serde_json::from_str::<CodexLine>(line) else {
            trace!(task_id = %self.task_id, "Ignoring non-event line");
            return Vec::new();
        };

        match parsed {
            CodexLine::ItemStarted { item } if item.is_collab_call("spawn_agent") => {
                self.created(&item).into_iter().collect()
            }
            CodexLine::ItemCompleted { item } if item.is_collab_call("spawn_agent") => {
                for thread_id in &item.receiver_thread_ids {
                    self.threads.insert(thread_id.clone(), item.id.clone());
                }
                // Some builds only report the completed item.
                self.created(&item).into_iter().collect()
            }
            CodexLine::ItemCompleted { item }
                if item.is_collab_call("wait") || item.is_collab_call("close_agent") =>
            {
                item.receiver_thread_ids
                    .iter()
                    .filter_map(|thread_id| self.threads.remove(thread_id))
                    .map(|item_id| SubtaskSignal::completed(self.task_id.clone(), item_id))
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}
