use agentrun_core::{CliTool, ReasoningEffort};

/// Argument vector for a non-interactive run of `tool`. The prompt goes to stdin.
///
/// Every tool is asked for JSON-lines output and told to skip permission
/// prompts. `effort` is only understood by codex and ignored elsewhere.
pub fn cli_args(
    tool: CliTool,
    model: Option<&str>,
    effort: Option<ReasoningEffort>,
) -> Vec<String> {
    let model = model.map(str::trim).filter(|m| !m.is_empty());

    let mut args: Vec<String> = match tool {
        CliTool::Claude => vec![
            "--print".into(),
            "--verbose".into(),
            "--output-format=stream-json".into(),
            "--include-partial-messages".into(),
            "--dangerously-skip-permissions".into(),
        ],
        CliTool::Codex => vec![
            "exec".into(),
            "--json".into(),
            "--dangerously-bypass-approvals-and-sandbox".into(),
        ],
        CliTool::Gemini => vec!["--yolo".into(), "--output-format=stream-json".into()],
        CliTool::OpenCode => vec!["run".into(), "--format".into(), "json".into()],
    };

    if let Some(model) = model {
        let flag = match tool {
            CliTool::Claude => "--model",
            _ => "-m",
        };
        args.push(flag.into());
        args.push(model.into());
    }

    if tool == CliTool::Codex {
        if let Some(effort) = effort {
            args.push("-c".into());
            args.push(format!("model_reasoning_effort=\"{}\"", effort.as_str()));
        }
        // Read the prompt from stdin.
        args.push("-".into());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_args() {
        assert_eq!(
            cli_args(CliTool::Claude, Some("opus"), Some(ReasoningEffort::High)),
            vec![
                "--print",
                "--verbose",
                "--output-format=stream-json",
                "--include-partial-messages",
                "--dangerously-skip-permissions",
                "--model",
                "opus",
            ]
        );
    }

    #[test]
    fn test_codex_args_end_with_stdin_marker() {
        let args = cli_args(CliTool::Codex, Some("gpt-5"), Some(ReasoningEffort::XHigh));
        assert_eq!(
            args,
            vec![
                "exec",
                "--json",
                "--dangerously-bypass-approvals-and-sandbox",
                "-m",
                "gpt-5",
                "-c",
                "model_reasoning_effort=\"xhigh\"",
                "-",
            ]
        );
        assert_eq!(cli_args(CliTool::Codex, None, None).last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_blank_model_is_omitted() {
        assert_eq!(
            cli_args(CliTool::Gemini, Some("  "), None),
            vec!["--yolo", "--output-format=stream-json"]
        );
        assert_eq!(
            cli_args(CliTool::OpenCode, Some("anthropic/claude-sonnet-4"), None),
            vec!["run", "--format", "json", "-m", "anthropic/claude-sonnet-4"]
        );
    }
}
