//! `claude --print` engine.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{Engine, EngineError, EngineRequest, EngineResult, feature_lines, probe_stdout};
use crate::io::process::{StreamRequest, run_streaming};

pub const DEFAULT_MODEL: &str = "opus";

/// Engine that spawns `claude --print` with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeEngine {
    program: PathBuf,
    model: String,
}

impl ClaudeEngine {
    pub fn new(model: &str) -> Self {
        Self::with_program("claude", model)
    }

    pub fn with_program(program: impl Into<PathBuf>, model: &str) -> Self {
        Self {
            program: program.into(),
            model: model.to_string(),
        }
    }
}

/// Prompt with the output schema appended.
pub fn build_prompt(prompt: &str, schema: &Value) -> String {
    let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "{prompt}\n\nReturn only JSON that strictly matches this schema. \
         Do not include extra keys or prose.\nSCHEMA:\n{schema_text}\n"
    )
}

/// Recover a JSON value from free-form model output.
///
/// Tries the whole text, then the last line that parses, then the slice
/// between the first `{` and the last `}`.
pub fn parse_json_from_text(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let last_line = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .last();
    if last_line.is_some() {
        return last_line;
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

impl Engine for ClaudeEngine {
    fn name(&self) -> &str {
        "claude"
    }

    #[instrument(skip_all, fields(workdir = %request.workdir.display(), model = %self.model))]
    fn execute(&self, request: &EngineRequest) -> Result<EngineResult, EngineError> {
        let prompt = build_prompt(&request.prompt, &request.output_schema);

        let mut cmd = Command::new(&self.program);
        cmd.args(["--model", self.model.as_str(), "--print"])
            .current_dir(&request.workdir);

        info!(program = %self.program.display(), "starting claude");
        let outcome = run_streaming(
            cmd,
            StreamRequest {
                stdin: Some(prompt.as_bytes()),
                events_path: &request.events_path,
                timeout: request.timeout,
                abort: Some(&request.abort),
                stdout_limit_bytes: request.output_limit_bytes,
            },
        )?;

        if outcome.exit_code != 0 {
            warn!(exit_code = outcome.exit_code, signal = ?outcome.signal, "claude failed");
        }
        Ok(EngineResult {
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            final_output: parse_json_from_text(&outcome.stdout),
            stderr_tail: outcome.stderr_tail,
            timed_out: outcome.timed_out,
        })
    }

    fn version(&self, workdir: &Path) -> Option<String> {
        probe_stdout(&self.program, &["--version"], workdir)
    }

    fn features(&self, workdir: &Path) -> Option<Vec<String>> {
        probe_stdout(&self.program, &["--help"], workdir).map(|text| feature_lines(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_whole_text_first() {
        assert_eq!(
            parse_json_from_text("  {\"status\":\"ok\"}  "),
            Some(json!({"status": "ok"}))
        );
    }

    #[test]
    fn falls_back_to_last_json_line() {
        let text = "thinking...\n{\"a\":1}\nmore prose\n{\"a\":2}\ndone";
        assert_eq!(parse_json_from_text(text), Some(json!({"a": 2})));
    }

    #[test]
    fn falls_back_to_brace_slice() {
        let text = "Here you go: {\"status\": \"ok\",\n \"summary\": \"x\"} thanks";
        assert_eq!(
            parse_json_from_text(text),
            Some(json!({"status": "ok", "summary": "x"}))
        );
    }

    #[test]
    fn gives_up_on_prose() {
        assert_eq!(parse_json_from_text("no json } here {"), None);
        assert_eq!(parse_json_from_text("   "), None);
    }

    #[test]
    fn prompt_carries_schema() {
        let prompt = build_prompt("Do X", &json!({"type": "object"}));
        assert!(prompt.starts_with("Do X\n\nReturn only JSON"));
        assert!(prompt.contains("SCHEMA:\n{\n  \"type\": \"object\"\n}\n"));
    }
}
