//! `codex exec --json` engine.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{Engine, EngineError, EngineRequest, EngineResult, feature_lines, probe_stdout};
use crate::io::process::{StreamRequest, run_streaming};

/// Sandbox mode passed when sandboxing is requested.
pub const SANDBOX_MODE: &str = "workspace-write";
/// Approval policy passed when approvals are requested.
pub const APPROVAL_POLICY: &str = "on-request";

pub const OUTPUT_SCHEMA_FILE: &str = "output-schema.json";
pub const LAST_MESSAGE_FILE: &str = "codex-last-message.json";

/// Engine that spawns `codex exec`.
#[derive(Debug, Clone)]
pub struct CodexEngine {
    program: PathBuf,
}

impl Default for CodexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CodexEngine {
    pub fn new() -> Self {
        Self::with_program("codex")
    }

    /// Use a different binary (a wrapper script, or a test double).
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Command-line arguments for one `codex exec` call. The prompt goes on stdin (`-`).
pub fn build_args(
    request: &EngineRequest,
    schema_path: &Path,
    last_message_path: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["exec".into(), "--json".into()];
    args.push("--output-schema".into());
    args.push(schema_path.into());
    if request.sandbox {
        args.push("--sandbox".into());
        args.push(SANDBOX_MODE.into());
    }
    if request.ask_for_approval {
        args.push("--ask-for-approval".into());
        args.push(APPROVAL_POLICY.into());
    }
    args.push("--output-last-message".into());
    args.push(last_message_path.into());
    if let Some(profile) = &request.profile {
        args.push("--profile".into());
        args.push(profile.into());
    }
    for (key, value) in &request.config_overrides {
        args.push("-c".into());
        args.push(format!("{key}={value}").into());
    }
    args.push("-".into());
    args
}

impl Engine for CodexEngine {
    fn name(&self) -> &str {
        "codex"
    }

    #[instrument(skip_all, fields(workdir = %request.workdir.display(), timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &EngineRequest) -> Result<EngineResult, EngineError> {
        fs::create_dir_all(&request.artifacts_dir).map_err(|source| EngineError::Io {
            context: format!("create artifacts dir {}", request.artifacts_dir.display()),
            source,
        })?;

        let schema_path = request.artifacts_dir.join(OUTPUT_SCHEMA_FILE);
        write_schema(&schema_path, &request.output_schema)?;

        let last_message_path = request.artifacts_dir.join(LAST_MESSAGE_FILE);
        remove_stale(&last_message_path)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(build_args(request, &schema_path, &last_message_path))
            .current_dir(&request.workdir);

        info!(program = %self.program.display(), "starting codex exec");
        let outcome = run_streaming(
            cmd,
            StreamRequest {
                stdin: Some(request.prompt.as_bytes()),
                events_path: &request.events_path,
                timeout: request.timeout,
                abort: Some(&request.abort),
                stdout_limit_bytes: request.output_limit_bytes,
            },
        )?;

        let final_output = read_last_message(&last_message_path)
            .or_else(|| outcome.scanner.last_agent_json().cloned())
            .or_else(|| outcome.scanner.last_json().cloned());

        if outcome.exit_code != 0 {
            warn!(exit_code = outcome.exit_code, signal = ?outcome.signal, "codex exec failed");
        }
        Ok(EngineResult {
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            final_output,
            stderr_tail: outcome.stderr_tail,
            timed_out: outcome.timed_out,
        })
    }

    fn version(&self, workdir: &Path) -> Option<String> {
        probe_stdout(&self.program, &["--version"], workdir)
    }

    fn features(&self, workdir: &Path) -> Option<Vec<String>> {
        ["--help", "help"].into_iter().find_map(|arg| {
            probe_stdout(&self.program, &[arg], workdir).map(|text| feature_lines(&text))
        })
    }
}

fn write_schema(path: &Path, schema: &Value) -> Result<(), EngineError> {
    let io_err = |source| EngineError::Io {
        context: format!("write output schema {}", path.display()),
        source,
    };
    let mut buf = serde_json::to_string_pretty(schema).map_err(|e| io_err(e.into()))?;
    buf.push('\n');
    fs::write(path, buf).map_err(io_err)
}

fn remove_stale(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale last-message file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(EngineError::Io {
            context: format!("remove stale last message {}", path.display()),
            source,
        }),
    }
}

/// Parsed last-message file, if present and valid JSON.
fn read_last_message(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(path = %path.display(), err = %err, "last-message file is not JSON");
            None
        }
    }
}
