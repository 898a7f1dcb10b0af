//! Checkpointed story executor CLI.
//!
//! Runs a task list of stories through an AI coding agent, one story per
//! agent call, and resumes interrupted runs from their checkpoint.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use storyrunner::core::types::StopReason;
use storyrunner::exit_codes;
use storyrunner::io::config::{RunnerConfig, config_path, init_config, load_config};
use storyrunner::io::engine::{EngineKind, Stage, build_engine};
use storyrunner::io::run_dir::{inspect_run_dir, resolve_home};
use storyrunner::io::run_record::now_timestamp;
use storyrunner::logging;
use storyrunner::run::{RunOptions, execute_run, record_setup_failure};
use storyrunner::status::{StatusOverrides, build_run_status};
use storyrunner::validate::validate_prd_file;

#[derive(Parser)]
#[command(
    name = "storyrunner",
    version,
    about = "Checkpointed story executor for AI coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.storyrunner/config.toml` with defaults.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Check a task list against the schema and policy.
    Validate {
        #[arg(long, value_name = "FILE")]
        prd: PathBuf,
    },
    /// Run (or resume) a task list.
    Run(RunArgs),
    /// Print the status of a run directory as JSON.
    Status {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Task list to execute.
    #[arg(long, value_name = "FILE")]
    prd: PathBuf,
    /// Continue an existing run directory.
    #[arg(long, value_name = "DIR")]
    resume: Option<PathBuf>,
    /// Engine for the work stage (defaults to the configured one).
    #[arg(long, value_enum)]
    engine: Option<EngineKind>,
    /// Let the agent write to the workspace only.
    #[arg(long, conflicts_with = "no_sandbox")]
    sandbox: bool,
    #[arg(long)]
    no_sandbox: bool,
    /// Let the agent ask before running commands.
    #[arg(long)]
    ask_for_approval: bool,
    #[arg(long)]
    profile: Option<String>,
    /// Engine config override, repeatable.
    #[arg(short = 'c', long = "config", value_name = "KEY=VALUE", value_parser = parse_override)]
    config_overrides: Vec<(String, String)>,
    /// Wall-clock limit per engine call.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Run `git fetch --all --prune` first and record the outcome.
    #[arg(long)]
    fetch: bool,
    /// Parent directory of `runs/`.
    #[arg(long, value_name = "DIR")]
    home: Option<PathBuf>,
    /// Repository to work in (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    repo: Option<PathBuf>,
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Init { force } => report(cmd_init(force)),
        Command::Validate { prd } => report(cmd_validate(&prd)),
        Command::Status { dir } => report(cmd_status(&dir)),
        Command::Run(args) => cmd_run(args),
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn report(result: Result<i32>) -> i32 {
    result.unwrap_or_else(|err| {
        eprintln!("{err:#}");
        exit_codes::FAILURE
    })
}

fn cmd_init(force: bool) -> Result<i32> {
    let cwd = env::current_dir().context("resolve current directory")?;
    let outcome = init_config(&cwd, force)?;
    if outcome.created {
        println!("wrote {}", outcome.path.display());
    } else {
        println!("exists {}", outcome.path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(prd: &Path) -> Result<i32> {
    let report = validate_prd_file(prd)?;
    println!("{}", report.render());
    Ok(if report.is_ok() {
        exit_codes::OK
    } else {
        exit_codes::FAILURE
    })
}

fn cmd_status(dir: &Path) -> Result<i32> {
    let (run_dir, run) = inspect_run_dir(dir)?;
    let status = build_run_status(&run_dir, &run, &StatusOverrides::default(), now_timestamp());
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("serialize status")?
    );
    Ok(exit_codes::OK)
}

fn cmd_run(args: RunArgs) -> i32 {
    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(err = %err, "install Ctrl-C handler");
    }

    let outcome = prepare_run(&args).and_then(|prepared| match prepared.setup_error {
        Some(err) => record_setup_failure(&prepared.options, StopReason::ValidationFailed, err),
        None => {
            let engine = build_engine(prepared.kind, &prepared.claude_model);
            execute_run(&prepared.options, engine.as_ref(), &abort)
        }
    });
    match outcome {
        Ok(outcome) => {
            if outcome.exit_status != exit_codes::OK
                && let Some(message) = &outcome.message
            {
                eprintln!("{message}");
            }
            println!("run_dir: {}", outcome.run_dir.display());
            println!("stop_reason: {}", outcome.stop_reason);
            outcome.exit_status
        }
        Err(err) => {
            eprintln!("{err:#}");
            println!("run_dir: -");
            println!("stop_reason: {}", StopReason::UnknownError);
            exit_codes::FAILURE
        }
    }
}

struct PreparedRun {
    options: RunOptions,
    kind: EngineKind,
    claude_model: String,
    /// Invalid config or flags; the run is recorded as failed without starting.
    setup_error: Option<anyhow::Error>,
}

/// Merge CLI flags over `.storyrunner/config.toml`.
///
/// `Err` only when no runs home can be resolved to record a failure in.
fn prepare_run(args: &RunArgs) -> Result<PreparedRun> {
    let repo_dir = match &args.repo {
        Some(dir) => dir.clone(),
        None => env::current_dir().context("resolve current directory")?,
    };
    let (cfg, mut setup_error) = match load_config(&config_path(&repo_dir)) {
        Ok(cfg) => (cfg, None),
        Err(err) => (RunnerConfig::default(), Some(err)),
    };
    let home = resolve_home(args.home.as_deref(), cfg.runs_home.as_deref())?;
    if args.timeout_secs == Some(0) && setup_error.is_none() {
        setup_error = Some(anyhow!("--timeout-secs must be > 0"));
    }
    let sandbox = if args.no_sandbox {
        false
    } else {
        args.sandbox || cfg.defaults.sandbox
    };
    let kind = args
        .engine
        .unwrap_or_else(|| cfg.stage_engine(Stage::Work));

    let options = RunOptions {
        repo_dir,
        prd_path: args.prd.clone(),
        resume_from: args.resume.clone(),
        home,
        sandbox,
        ask_for_approval: args.ask_for_approval || cfg.defaults.ask_for_approval,
        profile: args.profile.clone(),
        config_overrides: args
            .config_overrides
            .iter()
            .cloned()
            .collect::<BTreeMap<_, _>>(),
        timeout: Duration::from_secs(args.timeout_secs.unwrap_or(cfg.engine_timeout_secs)),
        output_limit_bytes: cfg.output_limit_bytes,
        fetch: args.fetch,
        argv: env::args().collect(),
    };
    Ok(PreparedRun {
        options,
        kind,
        claude_model: cfg.claude_model,
        setup_error,
    })
}
