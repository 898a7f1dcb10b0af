//! Run Directory Manager: creation and re-opening of `<home>/runs/<run_id>/`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use regex::Regex;
use tracing::{debug, info};

use crate::core::checkpoint::CheckpointState;
use crate::io::checkpoint_store::save_checkpoint;
use crate::io::run_record::{RunRecord, load_run_record, now_timestamp, save_run_record};

/// Environment variable overriding the default home directory.
pub const HOME_ENV: &str = "STORYRUNNER_HOME";

/// Resolved layout of one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    pub run_id: String,
    pub root: PathBuf,
    pub run_json_path: PathBuf,
    pub events_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub checkpoint_state_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub debug_bundle_dir: PathBuf,
    pub status_path: PathBuf,
    pub logs_path: PathBuf,
}

impl RunDir {
    fn at(root: PathBuf, run_id: String) -> Self {
        let checkpoints_dir = root.join("checkpoints");
        Self {
            run_id,
            run_json_path: root.join("run.json"),
            events_path: root.join("events.jsonl"),
            checkpoint_state_path: checkpoints_dir.join("state.json"),
            checkpoints_dir,
            artifacts_dir: root.join("artifacts"),
            debug_bundle_dir: root.join("debug_bundle"),
            status_path: root.join("status.json"),
            logs_path: root.join("logs.jsonl"),
            root,
        }
    }

    fn ensure_subdirs(&self) -> Result<()> {
        for dir in [
            &self.checkpoints_dir,
            &self.artifacts_dir,
            &self.debug_bundle_dir,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Resolve the home directory: CLI flag, then config, then `STORYRUNNER_HOME`,
/// then `$HOME/.storyrunner`.
pub fn resolve_home(cli_home: Option<&Path>, config_home: Option<&Path>) -> Result<PathBuf> {
    if let Some(home) = cli_home.or(config_home) {
        return Ok(home.to_path_buf());
    }
    if let Some(home) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let Some(user_home) = env::var_os("HOME").filter(|value| !value.is_empty()) else {
        bail!("cannot resolve home directory: set --home, runs_home, or {HOME_ENV}");
    };
    Ok(PathBuf::from(user_home).join(".storyrunner"))
}

/// Lowercase, hyphen-separated form of `title` safe for a path segment.
///
/// Returns an empty string when the title has no alphanumerics.
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    match Regex::new(r"[^a-z0-9]+") {
        Ok(re) => re
            .replace_all(&lowered, "-")
            .trim_matches('-')
            .chars()
            .take(48)
            .collect::<String>()
            .trim_end_matches('-')
            .to_string(),
        Err(_) => String::new(),
    }
}

/// `<timestamp>-<slug or "run">-<6 lowercase alphanumerics>`.
pub fn compute_run_id(title: Option<&str>) -> String {
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
    let slug = title.map(slugify).filter(|slug| !slug.is_empty());
    let slug = slug.as_deref().unwrap_or("run");
    format!("{timestamp}-{slug}-{}", generate_suffix())
}

fn generate_suffix() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// Create a fresh run directory with an empty event log, an initial run
/// record and an initial checkpoint.
pub fn create_run_dir(home: &Path, title: Option<&str>, contract_version: &str) -> Result<RunDir> {
    create_run_dir_with_id(home, compute_run_id(title), title, contract_version)
}

/// Fails when a directory for `run_id` already exists.
fn create_run_dir_with_id(
    home: &Path,
    run_id: String,
    title: Option<&str>,
    contract_version: &str,
) -> Result<RunDir> {
    let runs = home.join("runs");
    fs::create_dir_all(&runs).with_context(|| format!("create runs dir {}", runs.display()))?;
    let run_dir = RunDir::at(runs.join(&run_id), run_id);

    fs::create_dir(&run_dir.root)
        .with_context(|| format!("create run dir {}", run_dir.root.display()))?;
    run_dir.ensure_subdirs()?;
    fs::write(&run_dir.events_path, "")
        .with_context(|| format!("create event log {}", run_dir.events_path.display()))?;

    let cwd = env::current_dir().context("resolve current directory")?;
    let mut run = RunRecord::initial(&run_dir.run_id, title, &cwd, env::args().collect());
    run.contract_version = contract_version.to_string();
    save_run_record(&run_dir.run_json_path, &run)?;

    let state = CheckpointState::new(contract_version, &run_dir.run_id, now_timestamp());
    save_checkpoint(&run_dir.checkpoint_state_path, &state)?;

    info!(run_id = %run_dir.run_id, root = %run_dir.root.display(), "created run dir");
    Ok(run_dir)
}

/// Resolve an existing run directory and its record without touching disk.
pub fn inspect_run_dir(root: &Path) -> Result<(RunDir, RunRecord)> {
    let run_json_path = root.join("run.json");
    if !run_json_path.is_file() {
        bail!(
            "not a run directory: missing {}",
            run_json_path.display()
        );
    }
    let run = load_run_record(&run_json_path)?;
    let run_dir = RunDir::at(root.to_path_buf(), run.run_id.clone());
    Ok((run_dir, run))
}

/// Re-open an existing run directory for resume.
///
/// Missing subdirectories are re-created; the event log is left untouched.
pub fn load_run_dir(root: &Path) -> Result<RunDir> {
    let (run_dir, _) = inspect_run_dir(root)?;
    run_dir.ensure_subdirs()?;
    debug!(run_id = %run_dir.run_id, root = %root.display(), "loaded run dir");
    Ok(run_dir)
}
