//! Run Record (`run.json`): the authoritative metadata document for a run.
//!
//! There is exactly one writer per run. The record is passed by `&mut` through
//! the pipeline and persisted at defined transitions.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::StopReason;
use crate::io::json::{read_json, write_json};

/// Version string stamped into every persisted document.
pub const CONTRACT_VERSION: &str = "0.1";

/// Current UTC time as RFC 3339 with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub contract_version: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub cwd: String,
    pub repo: RepoInfo,
    #[serde(default)]
    pub engine: EngineInfo,
    pub cli: CliInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd: Option<PrdSnapshot>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchOutcome>,
}

/// Outcome of the optional `git fetch --all --prune`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchOutcome {
    pub ok: bool,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Engine identity; every field is a best-effort probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Invocation options as recorded for forensics and resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliInfo {
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<String>,
    pub sandbox: bool,
    pub ask_for_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default)]
    pub config_overrides: BTreeMap<String, String>,
}

/// Snapshot of the task list the run was started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrdSnapshot {
    pub schema_version: String,
    pub title: String,
    pub story_count: usize,
    pub sha256: String,
}

/// Progress mirrored from the checkpoint (the checkpoint wins on conflict).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub current_story_index: usize,
    pub completed_story_ids: Vec<String>,
    #[serde(default)]
    pub next_story_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RunError {
    /// Capture an error chain: the top message plus the full `{:#}` chain as trace.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let chain = format!("{err:#}");
        let message = err.to_string();
        let trace = (chain != message).then_some(chain);
        Self { message, trace }
    }
}

impl RunRecord {
    /// Fresh record as written by run-directory creation.
    pub fn initial(run_id: &str, title: Option<&str>, cwd: &Path, argv: Vec<String>) -> Self {
        let cwd = cwd.display().to_string();
        Self {
            contract_version: CONTRACT_VERSION.to_string(),
            run_id: run_id.to_string(),
            title: title.map(str::to_string),
            created_at: now_timestamp(),
            start_time: None,
            end_time: None,
            cwd: cwd.clone(),
            repo: RepoInfo {
                path: cwd,
                ..RepoInfo::default()
            },
            engine: EngineInfo::default(),
            cli: CliInfo {
                argv,
                ..CliInfo::default()
            },
            prd: None,
            progress: Progress::default(),
            stop_reason: None,
            exit_status: None,
            error: None,
        }
    }
}

pub fn load_run_record(path: &Path) -> Result<RunRecord> {
    debug!(path = %path.display(), "loading run record");
    read_json(path, "run record")
}

/// Atomically write the run record (temp file + rename).
pub fn save_run_record(path: &Path, run: &RunRecord) -> Result<()> {
    debug!(path = %path.display(), run_id = %run.run_id, "writing run record");
    write_json(path, run, "run record")
}
