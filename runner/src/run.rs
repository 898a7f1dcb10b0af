//! Orchestration for `storyrunner run`: preconditions, fresh/resume setup,
//! metadata capture, the executor, and finalization.
//!
//! Every terminating path ends in [`finalize`], which guarantees a run
//! directory exists (creating a fallback one when setup failed early), records
//! the stop reason, writes `status.json`, and writes a debug bundle for any
//! non-success outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::types::StopReason;
use crate::executor::{ExecutorContext, ExecutorOutcome, run_executor};
use crate::exit_codes;
use crate::io::debug_bundle::{DebugBundleRequest, write_debug_bundle};
use crate::io::engine::Engine;
use crate::io::git::Git;
use crate::io::prd_store::{LoadedPrd, load_prd};
use crate::io::run_dir::{RunDir, create_run_dir, load_run_dir};
use crate::io::run_log::RunLogger;
use crate::io::run_record::{
    CONTRACT_VERSION, CliInfo, EngineInfo, RunError, RunRecord, load_run_record, now_timestamp,
    save_run_record,
};
use crate::status::{RunState, StatusOverrides, write_run_status};

/// Title used for the run directory when setup fails before the task list is known.
const FALLBACK_TITLE: &str = "run";

/// Fully resolved inputs for one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Repository the agent works in.
    pub repo_dir: PathBuf,
    pub prd_path: PathBuf,
    /// Existing run directory to continue.
    pub resume_from: Option<PathBuf>,
    /// Parent of `runs/`.
    pub home: PathBuf,
    pub sandbox: bool,
    pub ask_for_approval: bool,
    pub profile: Option<String>,
    pub config_overrides: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Run `git fetch --all --prune` and record the outcome.
    pub fetch: bool,
    pub argv: Vec<String>,
}

impl RunOptions {
    fn cli_info(&self) -> CliInfo {
        CliInfo {
            argv: self.argv.clone(),
            prd_path: Some(self.prd_path.display().to_string()),
            resume_from: self
                .resume_from
                .as_ref()
                .map(|dir| dir.display().to_string()),
            sandbox: self.sandbox,
            ask_for_approval: self.ask_for_approval,
            profile: self.profile.clone(),
            config_overrides: self.config_overrides.clone(),
        }
    }
}

/// Final result of a run, as printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub stop_reason: StopReason,
    pub exit_status: i32,
    pub message: Option<String>,
}

/// A setup or executor failure classified with the stop reason it maps to.
#[derive(Debug)]
pub struct RunFailure {
    pub stop_reason: StopReason,
    pub error: anyhow::Error,
}

impl RunFailure {
    pub fn new(stop_reason: StopReason, error: anyhow::Error) -> Self {
        Self { stop_reason, error }
    }
}

/// Attach a stop reason to a fallible step.
pub trait StopWith<T> {
    fn stop_with(self, stop_reason: StopReason) -> Result<T, RunFailure>;
}

impl<T> StopWith<T> for Result<T> {
    fn stop_with(self, stop_reason: StopReason) -> Result<T, RunFailure> {
        self.map_err(|error| RunFailure::new(stop_reason, error))
    }
}

/// Run directory and record once setup got far enough to have them.
type Session = Option<(RunDir, RunRecord)>;

/// Execute (or resume) a run to a terminal outcome.
///
/// `Err` only when not even a fallback run directory could be created.
#[instrument(skip_all, fields(prd = %options.prd_path.display(), engine = engine.name()))]
pub fn execute_run(
    options: &RunOptions,
    engine: &dyn Engine,
    abort: &Arc<AtomicBool>,
) -> Result<RunOutcome> {
    let mut session: Session = None;
    let result = drive(options, engine, abort, &mut session);
    finalize(options, session, result)
}

/// Record a failure that happened before a run could be set up.
///
/// The outcome lands in a fallback run directory under `options.home`.
pub fn record_setup_failure(
    options: &RunOptions,
    stop_reason: StopReason,
    error: anyhow::Error,
) -> Result<RunOutcome> {
    finalize(options, None, Err(RunFailure::new(stop_reason, error)))
}

fn drive(
    options: &RunOptions,
    engine: &dyn Engine,
    abort: &Arc<AtomicBool>,
    session: &mut Session,
) -> Result<ExecutorOutcome, RunFailure> {
    let git = Git::new(&options.repo_dir);
    if !git.is_repo() {
        return Err(RunFailure::new(
            StopReason::NotAGitRepo,
            anyhow!("not a git repository: {}", options.repo_dir.display()),
        ));
    }

    let loaded = load_prd(&options.prd_path).stop_with(StopReason::ValidationFailed)?;

    let (run_dir, run) = match &options.resume_from {
        Some(dir) => {
            let run_dir = load_run_dir(dir).stop_with(StopReason::ValidationFailed)?;
            let run =
                load_run_record(&run_dir.run_json_path).stop_with(StopReason::ValidationFailed)?;
            let (run_dir, run) = session.insert((run_dir, run));
            ensure_same_task_list(run, &loaded).stop_with(StopReason::ValidationFailed)?;
            info!(run_id = %run_dir.run_id, "resuming run");
            (&*run_dir, run)
        }
        None => {
            let run_dir = create_run_dir(&options.home, Some(&loaded.prd.title), CONTRACT_VERSION)
                .stop_with(StopReason::UnknownError)?;
            let run =
                load_run_record(&run_dir.run_json_path).stop_with(StopReason::UnknownError)?;
            let (run_dir, run) = session.insert((run_dir, run));
            (&*run_dir, run)
        }
    };

    fill_metadata(options, &git, engine, &loaded, run);
    save_run_record(&run_dir.run_json_path, run).stop_with(StopReason::UnknownError)?;
    write_run_status(run_dir, run, &StatusOverrides::state(RunState::Initializing));
    RunLogger::new(&run_dir.logs_path, &run_dir.run_id).info(
        "run.start",
        None,
        Some(&json!({
            "engine": engine.name(),
            "resume": options.resume_from.is_some(),
            "story_count": loaded.prd.stories.len(),
        })),
    );
    write_run_status(run_dir, run, &StatusOverrides::state(RunState::Running));

    // A resumed run's worktree holds that run's own uncommitted work.
    if options.resume_from.is_none() {
        git.ensure_clean().stop_with(StopReason::DirtyWorktree)?;
    }

    let ctx = ExecutorContext {
        run_dir,
        prd: &loaded.prd,
        workdir: &options.repo_dir,
        engine,
        timeout: options.timeout,
        output_limit_bytes: options.output_limit_bytes,
        abort,
    };
    run_executor(&ctx, run).stop_with(StopReason::UnknownError)
}

/// Refuse to resume against a task list whose bytes changed.
///
/// A record without a snapshot never got past setup, so there is nothing to
/// compare against.
fn ensure_same_task_list(run: &RunRecord, loaded: &LoadedPrd) -> Result<()> {
    let Some(recorded) = run.prd.as_ref().map(|prd| prd.sha256.as_str()) else {
        warn!(run_id = %run.run_id, "run record has no task list digest");
        return Ok(());
    };
    if recorded != loaded.sha256 {
        return Err(anyhow!(
            "task list {} changed since the run started (recorded sha256 {recorded}, now {})",
            loaded.path.display(),
            loaded.sha256
        ));
    }
    Ok(())
}

fn fill_metadata(
    options: &RunOptions,
    git: &Git,
    engine: &dyn Engine,
    loaded: &LoadedPrd,
    run: &mut RunRecord,
) {
    if run.start_time.is_none() {
        run.start_time = Some(now_timestamp());
    }
    run.end_time = None;
    run.stop_reason = None;
    run.exit_status = None;
    run.error = None;
    run.title = Some(loaded.prd.title.clone());

    let repo_path = options.repo_dir.display().to_string();
    run.cwd = repo_path.clone();
    run.repo.path = repo_path;
    run.repo.branch = git
        .current_branch()
        .inspect_err(|err| warn!(err = %format!("{err:#}"), "branch probe failed"))
        .ok();
    run.repo.head_sha = git
        .head_sha()
        .inspect_err(|err| warn!(err = %format!("{err:#}"), "HEAD probe failed"))
        .ok();
    if options.fetch {
        let fetch = git.fetch_all_prune();
        if !fetch.ok {
            warn!(code = fetch.code, "git fetch failed");
        }
        run.repo.fetch = Some(fetch);
    }

    run.engine = probe_engine(engine, &options.repo_dir);
    run.cli = options.cli_info();
    run.prd = Some(loaded.snapshot());
}

fn probe_engine(engine: &dyn Engine, workdir: &Path) -> EngineInfo {
    let mut notes = Vec::new();
    let version = engine.version(workdir);
    if version.is_none() {
        notes.push("version probe failed".to_string());
    }
    let features = engine.features(workdir);
    if features.is_none() {
        notes.push("feature probe failed".to_string());
    }
    EngineInfo {
        name: Some(engine.name().to_string()),
        version,
        features,
        notes,
    }
}

fn finalize(
    options: &RunOptions,
    session: Session,
    result: Result<ExecutorOutcome, RunFailure>,
) -> Result<RunOutcome> {
    let (run_dir, mut run) = match session {
        Some(session) => session,
        None => {
            let run_dir = create_run_dir(&options.home, Some(FALLBACK_TITLE), CONTRACT_VERSION)?;
            let mut run = load_run_record(&run_dir.run_json_path)?;
            run.cli = options.cli_info();
            run.repo.path = options.repo_dir.display().to_string();
            info!(run_id = %run_dir.run_id, "created fallback run dir");
            (run_dir, run)
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(failure) => {
            let error = RunError::from_anyhow(&failure.error);
            let message = error.trace.clone().unwrap_or_else(|| error.message.clone());
            run.error = Some(error);
            ExecutorOutcome {
                stop_reason: failure.stop_reason,
                exit_status: exit_codes::FAILURE,
                message: Some(message),
            }
        }
    };

    run.stop_reason = Some(outcome.stop_reason);
    run.exit_status = Some(outcome.exit_status);
    run.end_time = Some(now_timestamp());
    if let Err(err) = save_run_record(&run_dir.run_json_path, &run) {
        warn!(err = %format!("{err:#}"), "save final run record");
    }
    write_run_status(
        &run_dir,
        &run,
        &StatusOverrides {
            state: Some(RunState::Stopped),
            message: outcome.message.clone(),
            current_story_id: Some(None),
            ..StatusOverrides::default()
        },
    );

    let logger = RunLogger::new(&run_dir.logs_path, &run_dir.run_id);
    let data = json!({
        "stop_reason": outcome.stop_reason,
        "exit_status": outcome.exit_status,
    });
    if outcome.exit_status == exit_codes::OK {
        logger.info("run.stop", None, Some(&data));
        info!(run_id = %run_dir.run_id, "run finished");
    } else {
        logger.error("run.stop", outcome.message.as_deref(), Some(&data));
        let reason = outcome
            .message
            .clone()
            .unwrap_or_else(|| outcome.stop_reason.to_string());
        write_debug_bundle(DebugBundleRequest {
            debug_dir: &run_dir.debug_bundle_dir,
            run: &run,
            repo_dir: &options.repo_dir,
            events_path: &run_dir.events_path,
            reason: &reason,
        });
        warn!(
            run_id = %run_dir.run_id,
            stop_reason = %outcome.stop_reason,
            exit_status = outcome.exit_status,
            "run stopped"
        );
    }

    Ok(RunOutcome {
        run_dir: run_dir.root,
        run_id: run_dir.run_id,
        stop_reason: outcome.stop_reason,
        exit_status: outcome.exit_status,
        message: outcome.message,
    })
}
