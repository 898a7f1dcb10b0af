//! The story executor loop.
//!
//! Runs stories in declared order until the task list is exhausted or a step
//! stops the run. Completion is tracked by story id in the checkpoint; a story
//! is only added to the completed set after its engine call exited cleanly
//! and returned a valid output envelope. A crash between "about to run" and
//! "completed" re-runs the in-flight story on resume.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::checkpoint::{CheckpointState, next_story};
use crate::core::output_contract::validate_output;
use crate::core::types::{AgentStatus, StopReason};
use crate::exit_codes;
use crate::io::artifacts::{StoryArtifact, write_completion_marker, write_story_artifact};
use crate::io::checkpoint_store::{load_checkpoint_for, save_checkpoint};
use crate::io::engine::{Engine, EngineRequest, EngineResult};
use crate::io::prompt::render_story_prompt;
use crate::io::run_dir::RunDir;
use crate::io::run_log::RunLogger;
use crate::io::run_record::{Progress, RunError, RunRecord, now_timestamp, save_run_record};
use crate::prd::Prd;
use crate::status::{RunState, StatusOverrides, write_run_status};

const STORY_OUTPUT_SCHEMA: &str = include_str!("../schemas/story_output.schema.json");

/// Everything the loop needs besides the mutable run record.
pub struct ExecutorContext<'a> {
    pub run_dir: &'a RunDir,
    pub prd: &'a Prd,
    /// Repository the agent works in.
    pub workdir: &'a std::path::Path,
    pub engine: &'a dyn Engine,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Set by the Ctrl-C handler.
    pub abort: &'a Arc<AtomicBool>,
}

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOutcome {
    pub stop_reason: StopReason,
    pub exit_status: i32,
    /// Human-readable reason for a non-success stop.
    pub message: Option<String>,
}

impl ExecutorOutcome {
    fn success() -> Self {
        Self {
            stop_reason: StopReason::Success,
            exit_status: exit_codes::OK,
            message: None,
        }
    }

    fn aborted() -> Self {
        Self {
            stop_reason: StopReason::UserAbort,
            exit_status: exit_codes::USER_ABORT,
            message: Some("interrupted by user".to_string()),
        }
    }

    fn engine_error(exit_status: i32, message: String) -> Self {
        Self {
            stop_reason: StopReason::EngineError,
            exit_status,
            message: Some(message),
        }
    }
}

/// Run stories until done or stopped.
///
/// `Err` is reserved for unexpected local failures (unreadable checkpoint,
/// unwritable run directory); every engine-side failure is an outcome.
#[instrument(skip_all, fields(run_id = %ctx.run_dir.run_id, engine = ctx.engine.name()))]
pub fn run_executor(ctx: &ExecutorContext<'_>, run: &mut RunRecord) -> Result<ExecutorOutcome> {
    let logger = RunLogger::new(&ctx.run_dir.logs_path, &ctx.run_dir.run_id);
    let checkpoint_path = &ctx.run_dir.checkpoint_state_path;
    let schema: Value =
        serde_json::from_str(STORY_OUTPUT_SCHEMA).context("parse story output schema")?;

    let mut state = load_checkpoint_for(checkpoint_path, ctx.prd)?;
    sync_progress(run, &state);
    save_run_record(&ctx.run_dir.run_json_path, run)?;
    info!(
        completed = state.completed_story_ids.len(),
        total = ctx.prd.stories.len(),
        "executor starting"
    );

    loop {
        if ctx.abort.load(Ordering::SeqCst) {
            logger.warn("run.abort", Some("interrupted before next story"), None);
            return Ok(ExecutorOutcome::aborted());
        }

        let Some((index, story)) = next_story(ctx.prd, &state.completed_story_ids) else {
            state.refresh_next(ctx.prd);
            save_checkpoint(checkpoint_path, &state)?;
            sync_progress(run, &state);
            save_run_record(&ctx.run_dir.run_json_path, run)?;
            write_completion_marker(&ctx.run_dir.artifacts_dir)?;
            info!("all stories complete");
            logger.info("run.complete", None, None);
            return Ok(ExecutorOutcome::success());
        };

        state.mark_about_to_run(ctx.prd, &story.id);
        save_checkpoint(checkpoint_path, &state)?;
        sync_progress(run, &state);
        save_run_record(&ctx.run_dir.run_json_path, run)?;
        write_run_status(
            ctx.run_dir,
            run,
            &StatusOverrides {
                state: Some(RunState::Running),
                current_story_id: Some(Some(story.id.clone())),
                ..StatusOverrides::default()
            },
        );

        let request = EngineRequest {
            workdir: ctx.workdir.to_path_buf(),
            prompt: render_story_prompt(ctx.prd, story, index)?,
            events_path: ctx.run_dir.events_path.clone(),
            artifacts_dir: ctx.run_dir.artifacts_dir.clone(),
            output_schema: schema.clone(),
            sandbox: run.cli.sandbox,
            ask_for_approval: run.cli.ask_for_approval,
            profile: run.cli.profile.clone(),
            config_overrides: run.cli.config_overrides.clone(),
            timeout: ctx.timeout,
            output_limit_bytes: ctx.output_limit_bytes,
            abort: Arc::clone(ctx.abort),
        };
        info!(story_id = %story.id, index, "story start");
        logger.info(
            "story.start",
            None,
            Some(&json!({"story_id": story.id, "index": index})),
        );

        let result = match ctx.engine.execute(&request) {
            Ok(result) => result,
            Err(err) => {
                let message = format!("engine {} failed: {err}", ctx.engine.name());
                warn!(story_id = %story.id, err = %err, "engine could not start");
                logger.error("story.engine_error", Some(&message), None);
                run.error = Some(RunError {
                    message: message.clone(),
                    trace: Some(format!("{:#}", anyhow::Error::new(err))),
                });
                return Ok(ExecutorOutcome::engine_error(exit_codes::FAILURE, message));
            }
        };

        let verdict = if result.exited_cleanly() {
            validate_output(result.final_output.as_ref())
        } else {
            Err(Vec::new())
        };
        let contract_errors = verdict.as_ref().err().cloned().unwrap_or_default();
        let artifact = StoryArtifact::new(
            story,
            ctx.engine.name(),
            &result,
            &contract_errors,
            now_timestamp(),
        );
        write_story_artifact(&ctx.run_dir.artifacts_dir, index, &artifact)?;

        if ctx.abort.load(Ordering::SeqCst) {
            logger.warn(
                "run.abort",
                Some("interrupted during story"),
                Some(&json!({"story_id": story.id})),
            );
            return Ok(ExecutorOutcome::aborted());
        }

        if !result.exited_cleanly() {
            let message = describe_unclean_exit(&story.id, &result);
            warn!(story_id = %story.id, exit_code = result.exit_code, "engine exited uncleanly");
            logger.error(
                "story.failed",
                Some(&message),
                Some(&json!({
                    "story_id": story.id,
                    "exit_code": result.exit_code,
                    "signal": result.signal,
                    "timed_out": result.timed_out,
                })),
            );
            let exit_status = if result.exit_code == 0 {
                exit_codes::FAILURE
            } else {
                result.exit_code
            };
            return Ok(ExecutorOutcome::engine_error(exit_status, message));
        }

        let output = match verdict {
            Ok(output) => output,
            Err(errors) => {
                let message = format!(
                    "story {} returned invalid output: {}",
                    story.id,
                    errors.join("; ")
                );
                warn!(story_id = %story.id, errors = ?errors, "output contract violated");
                logger.error(
                    "story.contract_violation",
                    Some(&message),
                    Some(&json!({"story_id": story.id, "errors": errors})),
                );
                return Ok(ExecutorOutcome::engine_error(exit_codes::FAILURE, message));
            }
        };

        if output.status != AgentStatus::Ok {
            warn!(story_id = %story.id, status = output.status.as_str(), "agent flagged story");
            logger.warn(
                "story.flagged",
                Some(&output.summary),
                Some(&json!({"story_id": story.id, "status": output.status.as_str()})),
            );
        }

        state.mark_completed(&story.id);
        state.refresh_next(ctx.prd);
        save_checkpoint(checkpoint_path, &state)?;
        sync_progress(run, &state);
        save_run_record(&ctx.run_dir.run_json_path, run)?;
        info!(story_id = %story.id, next = ?state.next_story_id, "story complete");
        logger.info(
            "story.complete",
            Some(&output.summary),
            Some(&json!({"story_id": story.id, "status": output.status.as_str()})),
        );
    }
}

fn sync_progress(run: &mut RunRecord, state: &CheckpointState) {
    run.progress = Progress {
        current_story_index: state.current_story_index,
        completed_story_ids: state.completed_story_ids.clone(),
        next_story_id: state.next_story_id.clone(),
    };
}

fn describe_unclean_exit(story_id: &str, result: &EngineResult) -> String {
    if result.timed_out {
        format!("story {story_id}: engine timed out")
    } else if let Some(signal) = &result.signal {
        format!("story {story_id}: engine killed by {signal}")
    } else {
        format!("story {story_id}: engine exited with code {}", result.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::io::checkpoint_store::load_checkpoint;
    use crate::io::engine::{FakeEngine, FakeScenario};
    use crate::io::run_dir::create_run_dir;
    use crate::io::run_record::{CONTRACT_VERSION, load_run_record};
    use crate::test_support::{ScriptedEngine, ok_result, prd_with_ids};

    struct Fixture {
        _temp: tempfile::TempDir,
        run_dir: RunDir,
        run: RunRecord,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = create_run_dir(temp.path(), Some("t"), CONTRACT_VERSION).expect("run dir");
        let run = load_run_record(&run_dir.run_json_path).expect("run");
        Fixture {
            _temp: temp,
            run_dir,
            run,
        }
    }

    fn no_abort() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn run_with(
        fx: &mut Fixture,
        prd: &Prd,
        engine: &dyn Engine,
        abort: &Arc<AtomicBool>,
    ) -> ExecutorOutcome {
        let workdir = fx.run_dir.root.clone();
        let ctx = ExecutorContext {
            run_dir: &fx.run_dir,
            prd,
            workdir: &workdir,
            engine,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1024 * 1024,
            abort,
        };
        run_executor(&ctx, &mut fx.run).expect("executor")
    }

    #[test]
    fn runs_every_story_and_writes_marker() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1", "S2", "S3"]);
        let engine = ScriptedEngine::always(ok_result());
        let outcome = run_with(&mut fx, &prd, &engine, &no_abort());

        assert_eq!(outcome, ExecutorOutcome::success());
        assert_eq!(engine.calls(), vec!["S1", "S2", "S3"]);
        let state = load_checkpoint(&fx.run_dir.checkpoint_state_path).expect("state");
        assert_eq!(state.completed_story_ids, vec!["S1", "S2", "S3"]);
        assert_eq!(state.next_story_id, None);
        assert_eq!(state.current_story_index, 3);
        assert!(fx.run_dir.artifacts_dir.join("completed.txt").is_file());
        assert!(fx.run_dir.artifacts_dir.join("story-2-S2.json").is_file());
        let saved = load_run_record(&fx.run_dir.run_json_path).expect("run");
        assert_eq!(saved.progress.completed_story_ids.len(), 3);
    }

    /// Verifies a second pass over a finished run calls the engine zero times.
    #[test]
    fn resume_after_completion_is_idempotent() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1", "S2"]);
        run_with(&mut fx, &prd, &ScriptedEngine::always(ok_result()), &no_abort());

        let engine = ScriptedEngine::always(ok_result());
        let outcome = run_with(&mut fx, &prd, &engine, &no_abort());
        assert_eq!(outcome.stop_reason, StopReason::Success);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn nonzero_exit_stops_without_completing() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1", "S2"]);
        let mut failed = ok_result();
        failed.exit_code = 3;
        failed.final_output = None;
        let engine = ScriptedEngine::new(vec![ok_result(), failed]);
        let outcome = run_with(&mut fx, &prd, &engine, &no_abort());

        assert_eq!(outcome.stop_reason, StopReason::EngineError);
        assert_eq!(outcome.exit_status, 3);
        let state = load_checkpoint(&fx.run_dir.checkpoint_state_path).expect("state");
        assert_eq!(state.completed_story_ids, vec!["S1"]);
        assert_eq!(state.next_story_id.as_deref(), Some("S2"));
        assert_eq!(state.current_story_index, 1);
        assert!(!fx.run_dir.artifacts_dir.join("completed.txt").exists());
    }

    #[test]
    fn signal_maps_to_engine_error_with_nonzero_status() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1"]);
        let outcome = run_with(
            &mut fx,
            &prd,
            &FakeEngine::new(FakeScenario::Signal),
            &no_abort(),
        );
        assert_eq!(outcome.stop_reason, StopReason::EngineError);
        assert_eq!(outcome.exit_status, 1);
        assert!(outcome.message.expect("message").contains("SIGKILL"));
    }

    /// Verifies a clean exit with a malformed envelope is not counted as done.
    #[test]
    fn invalid_output_blocks_completion() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1"]);
        let outcome = run_with(
            &mut fx,
            &prd,
            &FakeEngine::new(FakeScenario::BadStatus),
            &no_abort(),
        );
        assert_eq!(outcome.stop_reason, StopReason::EngineError);
        assert_eq!(outcome.exit_status, 1);

        let state = load_checkpoint(&fx.run_dir.checkpoint_state_path).expect("state");
        assert!(state.completed_story_ids.is_empty());
        let artifact: Value = serde_json::from_str(
            &std::fs::read_to_string(fx.run_dir.artifacts_dir.join("story-1-S1.json"))
                .expect("artifact"),
        )
        .expect("json");
        assert_eq!(artifact["engine"], "fake");
        assert_eq!(artifact["contract_errors"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn missing_output_blocks_completion() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1"]);
        let outcome = run_with(
            &mut fx,
            &prd,
            &FakeEngine::new(FakeScenario::NoJson),
            &no_abort(),
        );
        assert_eq!(outcome.stop_reason, StopReason::EngineError);
        assert!(outcome.message.expect("message").contains("missing final output"));
    }

    #[test]
    fn spawn_failure_records_error() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1"]);
        let outcome = run_with(
            &mut fx,
            &prd,
            &FakeEngine::new(FakeScenario::SpawnError),
            &no_abort(),
        );
        assert_eq!(outcome.stop_reason, StopReason::EngineError);
        assert_eq!(outcome.exit_status, 1);
        let error = fx.run.error.expect("error");
        assert!(error.message.contains("failed to spawn"), "{}", error.message);
        assert!(!fx.run_dir.artifacts_dir.join("story-1-S1.json").exists());
    }

    #[test]
    fn flagged_status_still_completes() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1"]);
        let mut flagged = ok_result();
        flagged.final_output = Some(json!({"status": "needs_human", "summary": "stuck"}));
        let outcome = run_with(
            &mut fx,
            &prd,
            &ScriptedEngine::always(flagged),
            &no_abort(),
        );
        assert_eq!(outcome.stop_reason, StopReason::Success);
        let logs = std::fs::read_to_string(&fx.run_dir.logs_path).expect("logs");
        assert!(logs.contains("story.flagged"));
    }

    #[test]
    fn abort_before_start_runs_nothing() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1"]);
        let engine = ScriptedEngine::always(ok_result());
        let outcome = run_with(&mut fx, &prd, &engine, &Arc::new(AtomicBool::new(true)));
        assert_eq!(outcome.stop_reason, StopReason::UserAbort);
        assert_eq!(outcome.exit_status, 130);
        assert!(engine.calls().is_empty());
    }

    /// Verifies an abort raised during a call leaves the story incomplete.
    #[test]
    fn abort_during_story_keeps_it_pending() {
        let mut fx = fixture();
        let prd = prd_with_ids(&["S1", "S2"]);
        let abort = Arc::new(AtomicBool::new(false));
        let engine = ScriptedEngine::always(ok_result()).abort_on_call(1, Arc::clone(&abort));
        let outcome = run_with(&mut fx, &prd, &engine, &abort);

        assert_eq!(outcome.stop_reason, StopReason::UserAbort);
        let state = load_checkpoint(&fx.run_dir.checkpoint_state_path).expect("state");
        assert!(state.completed_story_ids.is_empty());
        assert_eq!(state.next_story_id.as_deref(), Some("S1"));
    }
}
