//! Run status projection (`status.json`).
//!
//! The status file is a small, frequently rewritten view of the run record
//! for dashboards and humans. Building it is pure; writing it is best-effort
//! and never interrupts a run.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::StopReason;
use crate::io::json::write_json;
use crate::io::run_dir::RunDir;
use crate::io::run_record::{CONTRACT_VERSION, RunRecord, now_timestamp};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Initializing,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub contract_version: String,
    pub run_id: String,
    pub updated_at: String,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub progress: StatusProgress,
    pub paths: StatusPaths,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusProgress {
    pub completed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    pub next_story_id: Option<String>,
    pub current_story_id: Option<String>,
    pub current_story_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPaths {
    pub run_dir: String,
    pub run_json_path: String,
    pub status_path: String,
    pub events_path: String,
    pub logs_path: String,
    pub artifacts_dir: String,
    pub checkpoints_dir: String,
    pub debug_bundle_dir: String,
}

impl StatusPaths {
    fn from_run_dir(run_dir: &RunDir) -> Self {
        let show = |path: &std::path::Path| path.display().to_string();
        Self {
            run_dir: show(&run_dir.root),
            run_json_path: show(&run_dir.run_json_path),
            status_path: show(&run_dir.status_path),
            events_path: show(&run_dir.events_path),
            logs_path: show(&run_dir.logs_path),
            artifacts_dir: show(&run_dir.artifacts_dir),
            checkpoints_dir: show(&run_dir.checkpoints_dir),
            debug_bundle_dir: show(&run_dir.debug_bundle_dir),
        }
    }
}

/// Explicit values that take precedence over what the run record implies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusOverrides {
    pub state: Option<RunState>,
    pub message: Option<String>,
    /// `Some(None)` clears the current story explicitly.
    pub current_story_id: Option<Option<String>>,
    pub stop_reason: Option<StopReason>,
    pub exit_status: Option<i32>,
}

impl StatusOverrides {
    pub fn state(state: RunState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Project the run record into a status document.
///
/// State defaults to `stopped` when a stop reason is known, otherwise
/// `running`. While running, the current story defaults to the next one.
pub fn build_run_status(
    run_dir: &RunDir,
    run: &RunRecord,
    overrides: &StatusOverrides,
    updated_at: String,
) -> RunStatus {
    let stop_reason = overrides.stop_reason.or(run.stop_reason);
    let exit_status = overrides.exit_status.or(run.exit_status);
    let state = overrides.state.unwrap_or(if stop_reason.is_some() {
        RunState::Stopped
    } else {
        RunState::Running
    });
    let next_story_id = run.progress.next_story_id.clone();
    let current_story_id = match &overrides.current_story_id {
        Some(explicit) => explicit.clone(),
        None if state == RunState::Running => next_story_id.clone(),
        None => None,
    };

    RunStatus {
        contract_version: CONTRACT_VERSION.to_string(),
        run_id: run.run_id.clone(),
        updated_at,
        state,
        stop_reason,
        exit_status,
        message: overrides.message.clone(),
        progress: StatusProgress {
            completed: run.progress.completed_story_ids.len(),
            total: run.prd.as_ref().map(|prd| prd.story_count),
            next_story_id,
            current_story_id,
            current_story_index: run.progress.current_story_index,
        },
        paths: StatusPaths::from_run_dir(run_dir),
    }
}

/// Build and write `status.json`. Failures are logged and swallowed.
pub fn write_run_status(
    run_dir: &RunDir,
    run: &RunRecord,
    overrides: &StatusOverrides,
) -> Option<RunStatus> {
    let status = build_run_status(run_dir, run, overrides, now_timestamp());
    match write_json(&run_dir.status_path, &status, "run status") {
        Ok(()) => Some(status),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "write run status");
            None
        }
    }
}
