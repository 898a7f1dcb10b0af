//! Engine abstraction for agent invocation.
//!
//! The [`Engine`] trait decouples the executor loop from the actual agent
//! backend (`codex exec`, `claude --print`). Every engine returns the same
//! [`EngineResult`]; the executor never special-cases a backend. Tests use
//! scripted engines that return predetermined results without spawning
//! processes.

pub mod claude;
pub mod codex;
pub mod fake;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::io::process::run_command_with_timeout;

pub use claude::ClaudeEngine;
pub use codex::CodexEngine;
pub use fake::{FakeEngine, FakeScenario};

/// Default wall-clock limit for one engine call.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const PROBE_OUTPUT_LIMIT: usize = 256 * 1024;
const MAX_FEATURE_LINES: usize = 200;

/// Selectable agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Codex,
    Claude,
    Fake,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Codex => "codex",
            EngineKind::Claude => "claude",
            EngineKind::Fake => "fake",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named workflow step mapped to an engine by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Work,
    Plan,
    Review,
}

impl Stage {
    pub fn default_engine(self) -> EngineKind {
        match self {
            Stage::Work => EngineKind::Codex,
            Stage::Plan | Stage::Review => EngineKind::Claude,
        }
    }
}

/// Parameters for one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Repository working directory the agent runs in.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Raw stdout is appended here.
    pub events_path: PathBuf,
    /// Engine side files (schema, last message) live here.
    pub artifacts_dir: PathBuf,
    /// JSON Schema the final output must follow.
    pub output_schema: Value,
    pub sandbox: bool,
    pub ask_for_approval: bool,
    pub profile: Option<String>,
    pub config_overrides: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Bound on stdout kept in memory for parsing.
    pub output_limit_bytes: usize,
    /// Raised on Ctrl-C; the agent is killed when it is observed.
    pub abort: Arc<AtomicBool>,
}

/// Normalized outcome of one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResult {
    pub exit_code: i32,
    pub signal: Option<String>,
    pub final_output: Option<Value>,
    pub stderr_tail: String,
    pub timed_out: bool,
}

impl EngineResult {
    /// True when the process ended cleanly (exit 0, no signal, no timeout).
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none() && !self.timed_out
    }
}

/// Failures that prevent an engine call from happening at all.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Abstraction over agent execution backends.
pub trait Engine {
    /// Stable name recorded in the run record and artifacts.
    fn name(&self) -> &str;

    /// Run the agent once. Only spawn/setup failures are errors; a crashed or
    /// misbehaving agent is reported through [`EngineResult`].
    fn execute(&self, request: &EngineRequest) -> Result<EngineResult, EngineError>;

    /// Best-effort version probe.
    fn version(&self, _workdir: &Path) -> Option<String> {
        None
    }

    /// Best-effort feature listing.
    fn features(&self, _workdir: &Path) -> Option<Vec<String>> {
        None
    }
}

/// Construct the engine for `kind`.
pub fn build_engine(kind: EngineKind, claude_model: &str) -> Box<dyn Engine> {
    match kind {
        EngineKind::Codex => Box::new(CodexEngine::new()),
        EngineKind::Claude => Box::new(ClaudeEngine::new(claude_model)),
        EngineKind::Fake => Box::new(FakeEngine::from_env()),
    }
}

/// Run `program args...` briefly and return trimmed stdout when it succeeds.
///
/// Never fails: a missing binary or a non-zero exit yields `None`.
pub(crate) fn probe_stdout(program: &Path, args: &[&str], workdir: &Path) -> Option<String> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    match run_command_with_timeout(cmd, PROBE_TIMEOUT, PROBE_OUTPUT_LIMIT) {
        Ok(output) if output.status.success() && !output.timed_out => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        Ok(output) => {
            debug!(program = %program.display(), code = ?output.status.code(), "probe failed");
            None
        }
        Err(err) => {
            debug!(program = %program.display(), err = %err, "probe failed to run");
            None
        }
    }
}

/// Non-empty trimmed lines of a help text, capped.
pub(crate) fn feature_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_FEATURE_LINES)
        .map(str::to_string)
        .collect()
}
