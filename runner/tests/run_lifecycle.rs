//! Run-level lifecycle tests.
//!
//! These drive `execute_run` end to end against a scratch git repo with a
//! scripted engine: fresh run, failure, resume, legacy checkpoint migration,
//! the task-list hash guard, and debug bundle capture.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde_json::{Value, json};

use storyrunner::core::types::StopReason;
use storyrunner::io::checkpoint_store::load_checkpoint;
use storyrunner::io::engine::EngineResult;
use storyrunner::io::run_record::load_run_record;
use storyrunner::run::{RunOptions, RunOutcome, execute_run};
use storyrunner::status::{RunState, RunStatus};
use storyrunner::test_support::{ScriptedEngine, TestRepo, ok_result, prd_with_ids, write_prd};

struct Harness {
    repo: TestRepo,
    temp: tempfile::TempDir,
    prd_path: PathBuf,
}

impl Harness {
    fn new(ids: &[&str]) -> Self {
        let repo = TestRepo::new().expect("repo");
        let temp = tempfile::tempdir().expect("tempdir");
        let prd_path = write_prd(temp.path(), &prd_with_ids(ids));
        Self {
            repo,
            temp,
            prd_path,
        }
    }

    fn options(&self, resume_from: Option<&Path>) -> RunOptions {
        RunOptions {
            repo_dir: self.repo.root().to_path_buf(),
            prd_path: self.prd_path.clone(),
            resume_from: resume_from.map(Path::to_path_buf),
            home: self.temp.path().join("home"),
            sandbox: true,
            ask_for_approval: false,
            profile: None,
            config_overrides: BTreeMap::new(),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1024 * 1024,
            fetch: false,
            argv: vec!["storyrunner".to_string(), "run".to_string()],
        }
    }

    fn run(&self, engine: &ScriptedEngine, resume_from: Option<&Path>) -> RunOutcome {
        execute_run(&self.options(resume_from), engine, &Arc::new(AtomicBool::new(false))).expect("run")
    }
}

fn failed_result(code: i32) -> EngineResult {
    EngineResult {
        exit_code: code,
        signal: None,
        final_output: None,
        stderr_tail: "agent crashed".to_string(),
        timed_out: false,
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

/// Full lifecycle: fail on the second story, resume, finish, resume again.
///
/// Execution sequence:
/// 1. Fresh run: S1 ok, S2 exits 2 → ENGINE_ERROR, checkpoint points at S2.
/// 2. Resume: S2 and S3 run (S1 is skipped by identity) → SUCCESS.
/// 3. Resume again: nothing runs → SUCCESS.
#[test]
fn failure_then_resume_then_idempotent_resume() {
    let h = Harness::new(&["S1", "S2", "S3"]);

    let first_engine = ScriptedEngine::new(vec![ok_result(), failed_result(2)]);
    let first = h.run(&first_engine, None);
    assert_eq!(first.stop_reason, StopReason::EngineError);
    assert_eq!(first.exit_status, 2);
    assert_eq!(first_engine.calls(), vec!["S1", "S2"]);
    first_engine.assert_drained().expect("drained");

    let state = load_checkpoint(&first.run_dir.join("checkpoints/state.json")).expect("state");
    assert_eq!(state.completed_story_ids, vec!["S1"]);
    assert_eq!(state.next_story_id.as_deref(), Some("S2"));
    let artifact = read_json(&first.run_dir.join("artifacts/story-2-S2.json"));
    assert_eq!(artifact["exit_code"], 2);
    assert_eq!(artifact["stderr_tail"], "agent crashed");
    assert!(first.run_dir.join("debug_bundle/summary.md").is_file());

    let second_engine = ScriptedEngine::new(vec![ok_result(), ok_result()]);
    let second = h.run(&second_engine, Some(&first.run_dir));
    assert_eq!(second.stop_reason, StopReason::Success);
    assert_eq!(second.exit_status, 0);
    assert_eq!(second.run_dir, first.run_dir);
    assert_eq!(second_engine.calls(), vec!["S2", "S3"]);
    second_engine.assert_drained().expect("drained");
    assert_eq!(
        fs::read_to_string(second.run_dir.join("artifacts/completed.txt")).expect("marker"),
        "completed\n"
    );

    let run = load_run_record(&second.run_dir.join("run.json")).expect("run");
    assert_eq!(run.stop_reason, Some(StopReason::Success));
    assert_eq!(run.progress.completed_story_ids, vec!["S1", "S2", "S3"]);
    assert_eq!(run.progress.next_story_id, None);
    assert!(run.error.is_none());
    assert_eq!(run.cli.resume_from, Some(first.run_dir.display().to_string()));

    let third_engine = ScriptedEngine::new(Vec::new());
    let third = h.run(&third_engine, Some(&first.run_dir));
    assert_eq!(third.stop_reason, StopReason::Success);
    assert!(third_engine.calls().is_empty());
}

/// Verifies an index-only checkpoint is migrated once and persisted.
#[test]
fn legacy_checkpoint_migrates_on_resume() {
    let h = Harness::new(&["S1", "S2", "S3"]);
    let first = h.run(&ScriptedEngine::new(vec![failed_result(1)]), None);
    assert_eq!(first.stop_reason, StopReason::EngineError);

    let state_path = first.run_dir.join("checkpoints/state.json");
    let legacy = json!({
        "contract_version": "0.1",
        "run_id": first.run_id,
        "current_story_index": 2,
        "completed_story_ids": [],
        "updated_at": "2026-01-01T00:00:00.000Z"
    });
    fs::write(&state_path, legacy.to_string()).expect("legacy");

    let engine = ScriptedEngine::new(vec![ok_result()]);
    let resumed = h.run(&engine, Some(&first.run_dir));

    assert_eq!(resumed.stop_reason, StopReason::Success);
    assert_eq!(engine.calls(), vec!["S3"]);
    let raw = read_json(&state_path);
    assert!(raw.get("next_story_id").is_some());
    assert_eq!(raw["completed_story_ids"], json!(["S1", "S2", "S3"]));
}

/// Verifies a changed task list is refused before any story runs.
#[test]
fn resume_refuses_modified_task_list() {
    let h = Harness::new(&["S1", "S2"]);
    let first = h.run(&ScriptedEngine::new(vec![ok_result(), failed_result(1)]), None);
    let state_path = first.run_dir.join("checkpoints/state.json");
    let before = fs::read_to_string(&state_path).expect("state");

    write_prd(h.temp.path(), &prd_with_ids(&["S1", "S2", "S3"]));
    let engine = ScriptedEngine::new(Vec::new());
    let resumed = h.run(&engine, Some(&first.run_dir));

    assert_eq!(resumed.stop_reason, StopReason::ValidationFailed);
    assert_eq!(resumed.exit_status, 1);
    assert!(engine.calls().is_empty());
    assert!(resumed.message.expect("message").contains("changed since the run started"));
    let after = fs::read_to_string(&state_path).expect("state");
    assert_eq!(before, after);
}

#[test]
fn resume_from_missing_dir_is_validation_failure() {
    let h = Harness::new(&["S1"]);
    let bogus = h.temp.path().join("nowhere");
    let outcome = h.run(&ScriptedEngine::new(Vec::new()), Some(&bogus));

    assert_eq!(outcome.stop_reason, StopReason::ValidationFailed);
    assert!(outcome.run_id.contains("-run-"));
    assert!(outcome.run_dir.join("run.json").is_file());
}

/// Verifies a clean exit with an invalid envelope stops the run.
#[test]
fn contract_violation_stops_run() {
    let h = Harness::new(&["S1", "S2"]);
    let mut bad = ok_result();
    bad.final_output = Some(json!({"status": "done"}));
    let engine = ScriptedEngine::new(vec![bad]);
    let outcome = h.run(&engine, None);

    assert_eq!(outcome.stop_reason, StopReason::EngineError);
    assert_eq!(outcome.exit_status, 1);
    let artifact = read_json(&outcome.run_dir.join("artifacts/story-1-S1.json"));
    let errors = artifact["contract_errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 2, "{errors:?}");
    let state = load_checkpoint(&outcome.run_dir.join("checkpoints/state.json")).expect("state");
    assert!(state.completed_story_ids.is_empty());
}

/// Verifies the bundle files and the final status document.
#[test]
fn failure_writes_debug_bundle_and_stopped_status() {
    let h = Harness::new(&["S1"]);
    let outcome = h.run(&ScriptedEngine::new(vec![failed_result(7)]), None);
    let bundle = outcome.run_dir.join("debug_bundle");

    for name in [
        "run.json",
        "git-status.txt",
        "git-diff.patch",
        "events-tail.jsonl",
        "summary.md",
    ] {
        assert!(bundle.join(name).is_file(), "missing {name}");
    }
    let summary = fs::read_to_string(bundle.join("summary.md")).expect("summary");
    assert!(summary.starts_with("# Debug bundle\n"));
    assert!(summary.contains("StopReason: ENGINE_ERROR"));
    assert!(summary.contains(&format!("Run: {}", outcome.run_id)));
    let bundled_run = read_json(&bundle.join("run.json"));
    assert_eq!(bundled_run["exit_status"], 7);

    let status: RunStatus = serde_json::from_value(read_json(&outcome.run_dir.join("status.json")))
        .expect("status");
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.exit_status, Some(7));
    assert_eq!(status.progress.current_story_id, None);
    assert_eq!(status.progress.next_story_id.as_deref(), Some("S1"));

    let logs = fs::read_to_string(outcome.run_dir.join("logs.jsonl")).expect("logs");
    let events: Vec<String> = logs
        .lines()
        .map(|line| {
            let entry: Value = serde_json::from_str(line).expect("log line");
            entry["event"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(events.first().map(String::as_str), Some("run.start"));
    assert_eq!(events.last().map(String::as_str), Some("run.stop"));
}

#[test]
fn resume_skips_clean_worktree_check() {
    let h = Harness::new(&["S1", "S2"]);
    let first = h.run(&ScriptedEngine::new(vec![ok_result(), failed_result(1)]), None);
    fs::write(h.repo.root().join("work-in-progress.txt"), "partial\n").expect("dirty");

    let engine = ScriptedEngine::new(vec![ok_result()]);
    let resumed = h.run(&engine, Some(&first.run_dir));
    assert_eq!(resumed.stop_reason, StopReason::Success);
    assert_eq!(engine.calls(), vec!["S2"]);
}
