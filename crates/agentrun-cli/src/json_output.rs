//! JSON-lines event output on stdout.

use std::io::{self, Write};

use agentrun_engine::ports::BroadcastSink;
use serde::Serialize;

/// One line written to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent<'a> {
    pub event: &'a str,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl<'a> JsonEvent<'a> {
    /// Create a new JSON event with the current timestamp.
    pub fn new(event: &'a str, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    pub fn to_line(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Write this event as one line to stdout.
    pub fn emit(&self) {
        if let Some(json) = self.to_line() {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }
}

/// Broadcast sink printing every engine event.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl BroadcastSink for StdoutSink {
    fn publish(&self, event_type: &str, payload: serde_json::Value) {
        JsonEvent::new(event_type, payload).emit();
    }
}
