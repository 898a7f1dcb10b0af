//! Deterministic engine for tests and dry runs.
//!
//! Writes a small event stream and returns a scripted result chosen by
//! [`FakeScenario`]. No process is spawned.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Engine, EngineError, EngineRequest, EngineResult};

/// Environment variable selecting the scenario for [`FakeEngine::from_env`].
pub const SCENARIO_ENV: &str = "STORYRUNNER_FAKE_SCENARIO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeScenario {
    /// Clean exit with a valid `ok` envelope.
    Ok,
    /// Clean exit, no JSON at all.
    NoJson,
    /// Clean exit, truncated JSON.
    BadJson,
    /// Clean exit, envelope with an unknown status.
    BadStatus,
    /// Exit code 2.
    Nonzero,
    /// Killed by SIGKILL.
    Signal,
    /// The agent binary cannot be started.
    SpawnError,
}

impl FakeScenario {
    pub fn parse(value: &str) -> Option<Self> {
        let scenario = match value.trim() {
            "ok" => FakeScenario::Ok,
            "no-json" => FakeScenario::NoJson,
            "bad-json" => FakeScenario::BadJson,
            "bad-status" => FakeScenario::BadStatus,
            "nonzero" => FakeScenario::Nonzero,
            "signal" => FakeScenario::Signal,
            "spawn-error" => FakeScenario::SpawnError,
            _ => return None,
        };
        Some(scenario)
    }
}

#[derive(Debug, Clone)]
pub struct FakeEngine {
    scenario: FakeScenario,
}

impl FakeEngine {
    pub fn new(scenario: FakeScenario) -> Self {
        Self { scenario }
    }

    /// Scenario from `STORYRUNNER_FAKE_SCENARIO`; unset or unknown means `ok`.
    pub fn from_env() -> Self {
        let scenario = match env::var(SCENARIO_ENV) {
            Ok(raw) => FakeScenario::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown fake scenario, using ok");
                FakeScenario::Ok
            }),
            Err(_) => FakeScenario::Ok,
        };
        Self::new(scenario)
    }

    pub fn scenario(&self) -> FakeScenario {
        self.scenario
    }
}

fn ok_output() -> Value {
    json!({
        "status": "ok",
        "summary": "done",
        "files_changed": [],
        "tests_run": [],
        "notes": []
    })
}

fn append_events(path: &Path, lines: &[String]) -> Result<(), EngineError> {
    let io_err = |source| EngineError::Io {
        context: format!("append fake events {}", path.display()),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    let mut buf = lines.join("\n");
    buf.push('\n');
    file.write_all(buf.as_bytes()).map_err(io_err)
}

impl Engine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn execute(&self, request: &EngineRequest) -> Result<EngineResult, EngineError> {
        debug!(scenario = ?self.scenario, "fake engine invoked");
        let event = |message: &str| json!({"type": "event", "message": message}).to_string();
        let clean = |final_output: Option<Value>| EngineResult {
            exit_code: 0,
            signal: None,
            final_output,
            stderr_tail: String::new(),
            timed_out: false,
        };

        let result = match self.scenario {
            FakeScenario::SpawnError => {
                return Err(EngineError::Spawn {
                    program: "fake".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "scripted spawn failure",
                    ),
                });
            }
            FakeScenario::Ok => {
                let output = ok_output();
                append_events(&request.events_path, &[event("starting"), output.to_string()])?;
                clean(Some(output))
            }
            FakeScenario::NoJson => {
                append_events(&request.events_path, &["not-json".to_string()])?;
                clean(None)
            }
            FakeScenario::BadJson => {
                append_events(&request.events_path, &["{\"status\":".to_string()])?;
                clean(None)
            }
            FakeScenario::BadStatus => {
                let output = json!({"status": "done", "summary": "finished"});
                append_events(&request.events_path, &[output.to_string()])?;
                clean(Some(output))
            }
            FakeScenario::Nonzero => {
                append_events(&request.events_path, &[event("failing")])?;
                EngineResult {
                    exit_code: 2,
                    signal: None,
                    final_output: None,
                    stderr_tail: "fake failure".to_string(),
                    timed_out: false,
                }
            }
            FakeScenario::Signal => {
                append_events(&request.events_path, &[event("killed")])?;
                EngineResult {
                    exit_code: 1,
                    signal: Some("SIGKILL".to_string()),
                    final_output: None,
                    stderr_tail: String::new(),
                    timed_out: false,
                }
            }
        };
        Ok(result)
    }

    fn version(&self, _workdir: &Path) -> Option<String> {
        Some("fake 0.0.0".to_string())
    }

    fn features(&self, _workdir: &Path) -> Option<Vec<String>> {
        Some(vec!["fake".to_string(), "deterministic".to_string()])
    }
}
