//! Suppression of repeated output lines.
//!
//! CLIs that redraw their UI print the same status line over and over. A line
//! already forwarded for a task within the window is dropped; once the window
//! has passed since it was last forwarded, it goes through again.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use agentrun_core::TaskId;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Lines remembered per task.
const MAX_TRACKED_LINES: usize = 256;

#[derive(Debug, Default)]
struct TaskLines {
    last_forwarded: HashMap<String, Instant>,
    order: VecDeque<String>,
    /// The last forwarded text ended inside a line.
    mid_line: bool,
}

impl TaskLines {
    fn admit(&mut self, line: &str, now: Instant, window: Duration) -> bool {
        if let Some(at) = self.last_forwarded.get(line) {
            if now.duration_since(*at) < window {
                return false;
            }
        }

        if self.last_forwarded.insert(line.to_string(), now).is_none() {
            self.order.push_back(line.to_string());
            while self.order.len() > MAX_TRACKED_LINES {
                if let Some(oldest) = self.order.pop_front() {
                    self.last_forwarded.remove(&oldest);
                }
            }
        }
        true
    }
}

/// Per-task dedup state shared by all runs of an engine.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    tasks: Mutex<HashMap<TaskId, TaskLines>>,
}

impl DedupCache {
    /// A zero window disables suppression.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Keep only the lines of `text` that should be forwarded now.
    ///
    /// Only whole lines, started at a line boundary and terminated in `text`,
    /// are candidates for suppression. Blank lines, continuations of a line
    /// begun in an earlier chunk and an unterminated tail always pass.
    pub async fn filter(&self, task_id: &TaskId, text: &str) -> String {
        if self.window.is_zero() {
            return text.to_string();
        }

        let now = Instant::now();
        let mut tasks = self.tasks.lock().await;
        let lines = tasks.entry(task_id.clone()).or_default();

        text.split_inclusive('\n')
            .filter(|segment| {
                let continues = std::mem::replace(&mut lines.mid_line, !segment.ends_with('\n'));
                let Some(line) = segment.strip_suffix('\n') else {
                    return true;
                };
                let line = line.trim_end();
                continues || line.is_empty() || lines.admit(line, now, self.window)
            })
            .collect()
    }

    /// Forget everything about a task. Called when its run ends.
    pub async fn clear(&self, task_id: &TaskId) {
        self.tasks.lock().await.remove(task_id);
    }

    #[cfg(test)]
    async fn tracked(&self, task_id: &TaskId) -> usize {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|t| t.order.len())
            .unwrap_or(0)
    }
}
