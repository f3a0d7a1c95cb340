//! Provider identities.
//!
//! Every backend the engine can execute against is one variant of [`Provider`].
//! The variant decides the execution strategy: a local CLI subprocess, an HTTP
//! session behind the OAuth credential pool, or a user-configured API endpoint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::ApiProviderId;

/// Coding-agent CLIs launched as child processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliTool {
    Claude,
    Codex,
    Gemini,
    #[serde(rename = "opencode")]
    OpenCode,
}

impl CliTool {
    /// Executable name looked up on PATH.
    pub fn program(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::OpenCode => "opencode",
        }
    }
}

/// Providers reached over HTTP with credentials from the rotating pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthProvider {
    /// GitHub Copilot: a GitHub token exchanged for a short-lived Copilot token.
    Copilot,
    /// Google Antigravity: refresh-token OAuth against a Gemini-compatible API.
    Antigravity,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copilot => "copilot",
            Self::Antigravity => "antigravity",
        }
    }

    /// Model used when neither the caller nor the credential picks one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Copilot => "gpt-4o",
            Self::Antigravity => "gemini-2.5-pro",
        }
    }
}

/// Wire format of a user-configured API provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKind {
    /// OpenAI-compatible chat completions.
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Google,
}

impl FromStr for ApiKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "google" | "gemini" => Ok(Self::Google),
            other => Err(CoreError::UnknownApiKind(other.to_string())),
        }
    }
}

/// Reasoning effort hint forwarded to CLIs that accept one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    #[serde(rename = "xhigh")]
    XHigh,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::XHigh => "xhigh",
        }
    }
}

impl FromStr for ReasoningEffort {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "xhigh" => Ok(Self::XHigh),
            other => Err(CoreError::UnknownReasoningEffort(other.to_string())),
        }
    }
}

/// A named agent backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", content = "id", rename_all = "snake_case")]
pub enum Provider {
    Cli(CliTool),
    #[serde(rename = "oauth")]
    OAuth(OAuthProvider),
    Api(ApiProviderId),
}

impl Provider {
    /// Short label used in log lines such as `[claude] Error: ...`.
    pub fn label(&self) -> &str {
        match self {
            Self::Cli(tool) => tool.program(),
            Self::OAuth(p) => p.as_str(),
            Self::Api(id) => id.as_str(),
        }
    }

    /// Whether the provider runs as a child process.
    pub fn is_cli(&self) -> bool {
        matches!(self, Self::Cli(_))
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api(id) => write!(f, "api:{}", id),
            other => f.write_str(other.label()),
        }
    }
}

impl FromStr for Provider {
    type Err = CoreError;

    /// Parses `claude`, `codex`, `gemini`, `opencode`, `copilot`,
    /// `antigravity`, or `api:<provider-id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix("api:") {
            if id.is_empty() {
                return Err(CoreError::UnknownProvider(s.to_string()));
            }
            return Ok(Self::Api(ApiProviderId::new(id)));
        }
        match s {
            "claude" => Ok(Self::Cli(CliTool::Claude)),
            "codex" => Ok(Self::Cli(CliTool::Codex)),
            "gemini" => Ok(Self::Cli(CliTool::Gemini)),
            "opencode" => Ok(Self::Cli(CliTool::OpenCode)),
            "copilot" => Ok(Self::OAuth(OAuthProvider::Copilot)),
            "antigravity" => Ok(Self::OAuth(OAuthProvider::Antigravity)),
            other => Err(CoreError::UnknownProvider(other.to_string())),
        }
    }
}
