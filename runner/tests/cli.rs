//! CLI tests for the `storyrunner` binary.
//!
//! Spawns the binary against a scratch repo with the deterministic fake
//! engine and verifies stdout lines and exit codes.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

use storyrunner::exit_codes;
use storyrunner::io::engine::fake::SCENARIO_ENV;
use storyrunner::test_support::{TestRepo, prd_with_ids, write_prd};

fn storyrunner(repo: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_storyrunner"));
    cmd.current_dir(repo).env_remove(SCENARIO_ENV);
    cmd
}

fn stdout_value<'a>(stdout: &'a str, key: &str) -> &'a str {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .unwrap_or_else(|| panic!("missing {key} in {stdout}"))
}

fn run_fake(repo: &Path, prd: &Path, home: &Path, scenario: &str, extra: &[&str]) -> Output {
    storyrunner(repo)
        .env(SCENARIO_ENV, scenario)
        .args(["run", "--engine", "fake", "--prd"])
        .arg(prd)
        .arg("--home")
        .arg(home)
        .args(extra)
        .output()
        .expect("storyrunner run")
}

#[test]
fn run_with_fake_engine_succeeds() {
    let repo = TestRepo::new().expect("repo");
    let temp = tempfile::tempdir().expect("tempdir");
    let prd = write_prd(temp.path(), &prd_with_ids(&["S1", "S2"]));
    let home = temp.path().join("home");

    let output = run_fake(repo.root(), &prd, &home, "ok", &["-c", "model=o3"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(exit_codes::OK), "{stdout}");
    assert_eq!(stdout_value(&stdout, "stop_reason: "), "SUCCESS");
    let run_dir = Path::new(stdout_value(&stdout, "run_dir: "));
    assert!(run_dir.starts_with(home.join("runs")));
    assert!(run_dir.join("artifacts/completed.txt").is_file());

    let run: Value = serde_json::from_str(
        &std::fs::read_to_string(run_dir.join("run.json")).expect("run.json"),
    )
    .expect("json");
    assert_eq!(run["engine"]["name"], "fake");
    assert_eq!(run["cli"]["config_overrides"]["model"], "o3");
    assert_eq!(run["cli"]["sandbox"], true);
    let events = std::fs::read_to_string(run_dir.join("events.jsonl")).expect("events");
    assert_eq!(events.lines().count(), 4);
}

/// Verifies the engine's own exit code becomes the process exit code.
#[test]
fn nonzero_engine_exit_is_propagated() {
    let repo = TestRepo::new().expect("repo");
    let temp = tempfile::tempdir().expect("tempdir");
    let prd = write_prd(temp.path(), &prd_with_ids(&["S1"]));

    let output = run_fake(repo.root(), &prd, &temp.path().join("home"), "nonzero", &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(2), "{stdout}");
    assert_eq!(stdout_value(&stdout, "stop_reason: "), "ENGINE_ERROR");
    let run_dir = Path::new(stdout_value(&stdout, "run_dir: "));
    assert!(run_dir.join("debug_bundle/summary.md").is_file());
}

#[test]
fn dirty_repo_prints_run_dir_and_reason() {
    let repo = TestRepo::new().expect("repo");
    std::fs::write(repo.root().join("untracked.txt"), "x").expect("dirty");
    let temp = tempfile::tempdir().expect("tempdir");
    let prd = write_prd(temp.path(), &prd_with_ids(&["S1"]));

    let output = run_fake(repo.root(), &prd, &temp.path().join("home"), "ok", &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(exit_codes::FAILURE));
    assert_eq!(stdout_value(&stdout, "stop_reason: "), "DIRTY_WORKTREE");
    assert!(stdout.contains("run_dir: "));

    repo.commit_all("chore: track file").expect("commit");
    let output = run_fake(repo.root(), &prd, &temp.path().join("home"), "ok", &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
}

#[test]
fn resume_via_cli_finishes_run() {
    let repo = TestRepo::new().expect("repo");
    let temp = tempfile::tempdir().expect("tempdir");
    let prd = write_prd(temp.path(), &prd_with_ids(&["S1", "S2"]));
    let home = temp.path().join("home");

    let failed = run_fake(repo.root(), &prd, &home, "bad-status", &[]);
    let failed_stdout = String::from_utf8_lossy(&failed.stdout).to_string();
    assert_eq!(stdout_value(&failed_stdout, "stop_reason: "), "ENGINE_ERROR");
    let run_dir = stdout_value(&failed_stdout, "run_dir: ").to_string();

    let resumed = run_fake(repo.root(), &prd, &home, "ok", &["--resume", &run_dir]);
    let stdout = String::from_utf8_lossy(&resumed.stdout);
    assert_eq!(resumed.status.code(), Some(exit_codes::OK), "{stdout}");
    assert_eq!(stdout_value(&stdout, "run_dir: "), run_dir);

    let status = storyrunner(repo.root())
        .args(["status", &run_dir])
        .output()
        .expect("status");
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let status: Value = serde_json::from_slice(&status.stdout).expect("status json");
    assert_eq!(status["state"], "stopped");
    assert_eq!(status["stop_reason"], "SUCCESS");
    assert_eq!(status["progress"]["completed"], 2);
}

#[test]
fn validate_reports_violations() {
    let temp = tempfile::tempdir().expect("tempdir");
    let good = write_prd(temp.path(), &prd_with_ids(&["S1"]));
    let output = storyrunner(temp.path())
        .args(["validate", "--prd"])
        .arg(&good)
        .output()
        .expect("validate");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ok");

    let bad_dir = temp.path().join("bad");
    std::fs::create_dir_all(&bad_dir).expect("mkdir");
    let bad = write_prd(&bad_dir, &prd_with_ids(&["S1", "S1"]));
    let output = storyrunner(temp.path())
        .args(["validate", "--prd"])
        .arg(&bad)
        .output()
        .expect("validate");
    assert_eq!(output.status.code(), Some(exit_codes::FAILURE));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "- duplicate story ids: S1"
    );
}

/// Verifies init writes a config without dirtying the repo.
#[test]
fn init_keeps_worktree_clean() {
    let repo = TestRepo::new().expect("repo");
    let output = storyrunner(repo.root())
        .arg("init")
        .output()
        .expect("init");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(repo.root().join(".storyrunner/config.toml").is_file());

    let git = storyrunner::io::git::Git::new(repo.root());
    git.ensure_clean().expect("clean after init");
}

/// Verifies a malformed config is recorded in a fallback run directory.
#[test]
fn malformed_config_still_records_a_run() {
    let repo = TestRepo::new().expect("repo");
    let config_dir = repo.root().join(".storyrunner");
    std::fs::create_dir_all(&config_dir).expect("mkdir");
    std::fs::write(config_dir.join("config.toml"), "engine_timeout_secs = \"x\"\n").expect("config");
    let temp = tempfile::tempdir().expect("tempdir");
    let prd = write_prd(temp.path(), &prd_with_ids(&["S1"]));
    let home = temp.path().join("home");

    let output = run_fake(repo.root(), &prd, &home, "ok", &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(exit_codes::FAILURE), "{stdout}");
    assert_eq!(stdout_value(&stdout, "stop_reason: "), "VALIDATION_FAILED");
    let run_dir = Path::new(stdout_value(&stdout, "run_dir: "));
    assert!(run_dir.starts_with(home.join("runs")));
    assert!(run_dir.join("debug_bundle/summary.md").is_file());
    let run: Value = serde_json::from_str(
        &std::fs::read_to_string(run_dir.join("run.json")).expect("run.json"),
    )
    .expect("json");
    assert_eq!(run["stop_reason"], "VALIDATION_FAILED");
    assert!(
        run["error"]["message"]
            .as_str()
            .is_some_and(|message| message.contains("config.toml")),
        "{run}"
    );
    assert!(String::from_utf8_lossy(&output.stderr).contains("config.toml"));
}
