//! Engine configuration.
//!
//! Tunables are read once at process start. [`EngineConfig::from_env`] layers
//! `AGENTRUN_*` environment variables over [`EngineConfig::default`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use agentrun_core::CliTool;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// HTTP endpoints used by the OAuth providers. Overridable for tests and proxies.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Exchanges a GitHub token for a Copilot token.
    pub copilot_token_url: String,
    /// Base URL of the Copilot chat API.
    pub copilot_api_base: String,
    /// Google OAuth token endpoint.
    pub google_token_url: String,
    /// Base URL of the Gemini-compatible API used by antigravity.
    pub antigravity_api_base: String,
    /// OAuth client id for the antigravity refresh flow.
    pub antigravity_client_id: String,
    /// OAuth client secret for the antigravity refresh flow.
    pub antigravity_client_secret: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            copilot_token_url: "https://api.github.com/copilot_internal/v2/token".to_string(),
            copilot_api_base: "https://api.githubcopilot.com".to_string(),
            google_token_url: "https://oauth2.googleapis.com/token".to_string(),
            antigravity_api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            antigravity_client_id: String::new(),
            antigravity_client_secret: String::new(),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Silence tolerated between chunks. Zero disables the idle timer.
    pub idle_timeout: Duration,

    /// Maximum total run duration. Zero disables the hard timer.
    pub hard_timeout: Duration,

    /// Window in which identical output lines are broadcast once. Zero disables.
    pub dedup_window: Duration,

    /// Try fallback credentials and promote the one that works.
    pub auto_swap: bool,

    /// Where prompt files are written for the lifetime of a run.
    pub prompt_dir: PathBuf,

    /// Default timeout for one-shot exchanges.
    pub one_shot_timeout: Duration,

    /// `max_tokens` sent to Anthropic-style APIs.
    pub anthropic_max_tokens: u32,

    pub endpoints: Endpoints,

    /// Executables used instead of the tool's default program name.
    pub cli_programs: HashMap<CliTool, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(900_000),
            hard_timeout: Duration::ZERO,
            dedup_window: Duration::from_millis(1_500),
            auto_swap: true,
            prompt_dir: std::env::temp_dir().join("agentrun-prompts"),
            one_shot_timeout: Duration::from_secs(180),
            anthropic_max_tokens: 8_192,
            endpoints: Endpoints::default(),
            cli_programs: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `AGENTRUN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_u64(&lookup, "AGENTRUN_IDLE_TIMEOUT_MS")? {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "AGENTRUN_HARD_TIMEOUT_MS")? {
            config.hard_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "AGENTRUN_OUTPUT_DEDUP_WINDOW_MS")? {
            config.dedup_window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "AGENTRUN_ONE_SHOT_TIMEOUT_MS")? {
            config.one_shot_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("AGENTRUN_AUTO_SWAP") {
            config.auto_swap = parse_bool("AGENTRUN_AUTO_SWAP", &raw)?;
        }
        if let Some(dir) = lookup("AGENTRUN_PROMPT_DIR").filter(|d| !d.is_empty()) {
            config.prompt_dir = PathBuf::from(dir);
        }

        let endpoints = &mut config.endpoints;
        for (key, slot) in [
            ("AGENTRUN_COPILOT_TOKEN_URL", &mut endpoints.copilot_token_url),
            ("AGENTRUN_COPILOT_API_BASE", &mut endpoints.copilot_api_base),
            ("AGENTRUN_GOOGLE_TOKEN_URL", &mut endpoints.google_token_url),
            ("AGENTRUN_ANTIGRAVITY_API_BASE", &mut endpoints.antigravity_api_base),
            ("AGENTRUN_ANTIGRAVITY_CLIENT_ID", &mut endpoints.antigravity_client_id),
            ("AGENTRUN_ANTIGRAVITY_CLIENT_SECRET", &mut endpoints.antigravity_client_secret),
        ] {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *slot = value;
            }
        }

        for tool in [CliTool::Claude, CliTool::Codex, CliTool::Gemini, CliTool::OpenCode] {
            let key = format!("AGENTRUN_{}_BIN", tool.program().to_ascii_uppercase());
            if let Some(path) = lookup(&key).filter(|p| !p.is_empty()) {
                config.cli_programs.insert(tool, path);
            }
        }

        Ok(config)
    }

    /// Builder method to run `tool` from a specific executable.
    pub fn with_cli_program(mut self, tool: CliTool, program: impl Into<String>) -> Self {
        self.cli_programs.insert(tool, program.into());
        self
    }

    /// Executable for `tool`.
    pub fn program_for(&self, tool: CliTool) -> &str {
        self.cli_programs
            .get(&tool)
            .map(String::as_str)
            .unwrap_or_else(|| tool.program())
    }
}

fn parse_u64<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key,
                value: raw,
                expected: "a non-negative integer (milliseconds)",
            }),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            expected: "a boolean",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(900));
        assert!(config.hard_timeout.is_zero());
        assert!(config.auto_swap);
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("AGENTRUN_IDLE_TIMEOUT_MS", "5000"),
            ("AGENTRUN_HARD_TIMEOUT_MS", "60000"),
            ("AGENTRUN_OUTPUT_DEDUP_WINDOW_MS", "0"),
            ("AGENTRUN_AUTO_SWAP", "off"),
            ("AGENTRUN_COPILOT_API_BASE", "http://127.0.0.1:9"),
            ("AGENTRUN_CODEX_BIN", "/opt/codex/bin/codex"),
        ]))
        .unwrap();

        assert_eq!(config.idle_timeout, Duration::from_millis(5000));
        assert_eq!(config.hard_timeout, Duration::from_secs(60));
        assert!(config.dedup_window.is_zero());
        assert!(!config.auto_swap);
        assert_eq!(config.endpoints.copilot_api_base, "http://127.0.0.1:9");
        assert_eq!(config.program_for(CliTool::Codex), "/opt/codex/bin/codex");
        assert_eq!(config.program_for(CliTool::Claude), "claude");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("AGENTRUN_IDLE_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("AGENTRUN_IDLE_TIMEOUT_MS"));

        assert!(EngineConfig::from_lookup(lookup_from(&[("AGENTRUN_AUTO_SWAP", "maybe")])).is_err());
    }
}
