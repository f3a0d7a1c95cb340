//! JSON-lines messages printed by coding-agent CLIs.
//!
//! Two dialects carry sub-agent lifecycle markers:
//! - claude `stream-json`: `tool_use` / `tool_result` content items.
//! - codex `exec --json`: `item.started` / `item.completed` events.
//!
//! Everything else is parsed only far enough to recover the assistant text.

use serde::Deserialize;
use serde_json::Value;

/// Top-level message from `claude --output-format=stream-json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeLine {
    /// System initialization message.
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    /// Assistant response message.
    Assistant { message: MessageBody },

    /// User message (carries tool results).
    User { message: MessageBody },

    /// Partial-message streaming event.
    StreamEvent { event: StreamEvent },

    /// Execution result.
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
    },

    #[serde(other)]
    Other,
}

/// Message payload; `content` is either a string or a list of items.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Items(Vec<ContentItem>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Items(Vec::new())
    }
}

impl MessageBody {
    /// Content items; a plain string body has none.
    pub fn items(&self) -> &[ContentItem] {
        match &self.content {
            MessageContent::Items(items) => items,
            MessageContent::Text(_) => &[],
        }
    }
}

/// Content item in a message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },

    Thinking {
        #[serde(default)]
        thinking: String,
    },

    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: Option<bool>,
    },

    #[serde(other)]
    Other,
}

/// Streaming event types (only text deltas matter here).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ContentBlockDelta { delta: ContentDelta },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },

    #[serde(other)]
    Unknown,
}

/// Event from `codex exec --json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CodexLine {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },

    #[serde(rename = "item.started")]
    ItemStarted { item: CodexItem },

    #[serde(rename = "item.updated")]
    ItemUpdated { item: CodexItem },

    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },

    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<Value>,
    },

    #[serde(other)]
    Other,
}

/// A codex thread item. Collab tool calls set `tool` and the thread ids.
#[derive(Debug, Clone, Deserialize)]
pub struct CodexItem {
    pub id: String,

    #[serde(rename = "type")]
    pub item_type: String,

    #[serde(default)]
    pub tool: Option<String>,

    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub text: Option<String>,

    /// Child threads a collab call spawned or waited on.
    #[serde(default)]
    pub receiver_thread_ids: Vec<String>,
}

impl CodexItem {
    pub fn is_collab_call(&self, tool: &str) -> bool {
        self.item_type == "collab_tool_call" && self.tool.as_deref() == Some(tool)
    }
}

/// Text recovered from one output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineText {
    /// Part of the answer.
    Fragment(String),
    /// The CLI's own final answer; supersedes fragments.
    Final(String),
}

/// Recover assistant text from a JSON line of any supported CLI.
pub fn text_of_line(line: &str) -> Option<LineText> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    let kind = value.get("type").and_then(Value::as_str)?;

    match kind {
        // claude
        "assistant" => {
            let body: MessageBody = serde_json::from_value(value.get("message")?.clone()).ok()?;
            let text: String = body
                .items()
                .iter()
                .filter_map(|item| match item {
                    ContentItem::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            (!text.is_empty()).then_some(LineText::Fragment(text))
        }
        "result" => value
            .get("result")
            .and_then(Value::as_str)
            .map(|s| LineText::Final(s.to_string())),
        // codex
        "item.completed" => {
            let item = value.get("item")?;
            (item.get("type").and_then(Value::as_str) == Some("agent_message"))
                .then(|| item.get("text").and_then(Value::as_str))
                .flatten()
                .map(|s| LineText::Fragment(s.to_string()))
        }
        // gemini
        "message" => {
            (value.get("role").and_then(Value::as_str) == Some("assistant"))
                .then(|| value.get("content").and_then(Value::as_str))
                .flatten()
                .map(|s| LineText::Fragment(s.to_string()))
        }
        // opencode
        "text" => value
            .pointer("/part/text")
            .and_then(Value::as_str)
            .map(|s| LineText::Fragment(s.to_string())),
        _ => None,
    }
}

/// Accumulates the answer text of a JSON-lines transcript.
#[derive(Debug, Default)]
pub struct TextCollector {
    fragments: String,
    final_text: Option<String>,
}

impl TextCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) {
        match text_of_line(line) {
            Some(LineText::Fragment(text)) => self.fragments.push_str(&text),
            Some(LineText::Final(text)) => self.final_text = Some(text),
            None => {}
        }
    }

    /// Final answer if the CLI reported one, else the joined fragments.
    pub fn into_text(self) -> String {
        self.final_text.unwrap_or(self.fragments)
    }
}
