//! Test-only helpers: task-list builders, a scratch git repo and a scripted
//! engine that returns queued results without spawning processes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::io::engine::{Engine, EngineError, EngineRequest, EngineResult};
use crate::prd::{PRD_SCHEMA_VERSION, Prd, Story, StorySize};

/// Deterministic `S`-sized story with one acceptance criterion.
pub fn story(id: &str) -> Story {
    Story {
        id: id.to_string(),
        title: format!("{id} title"),
        size: StorySize::S,
        acceptance: vec![format!("{id} acceptance")],
        constraints: None,
    }
}

/// Task list with one default story per id, in the given order.
pub fn prd_with_ids(ids: &[&str]) -> Prd {
    Prd {
        schema_version: PRD_SCHEMA_VERSION.to_string(),
        title: "Test task list".to_string(),
        repo: None,
        principles: None,
        stories: ids.iter().map(|id| story(id)).collect(),
    }
}

/// Write `prd` as pretty JSON to `<dir>/prd.json`.
pub fn write_prd(dir: &Path, prd: &Prd) -> PathBuf {
    let path = dir.join("prd.json");
    let mut raw = serde_json::to_string_pretty(prd).expect("serialize prd");
    raw.push('\n');
    fs::write(&path, raw).expect("write prd");
    path
}

/// Clean engine result carrying a valid `ok` envelope.
pub fn ok_result() -> EngineResult {
    EngineResult {
        exit_code: 0,
        signal: None,
        final_output: Some(json!({
            "status": "ok",
            "summary": "done",
            "files_changed": [],
            "tests_run": [],
            "notes": []
        })),
        stderr_tail: String::new(),
        timed_out: false,
    }
}

/// Scratch git repository with one commit on the default branch.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let root = dir.path();
        git(root, &["init", "-q"])?;
        git(root, &["config", "user.email", "test@example.com"])?;
        git(root, &["config", "user.name", "test"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README.md")?;
        git(root, &["add", "."])?;
        git(root, &["commit", "-q", "-m", "chore: init"])?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Stage and commit everything in the worktree.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        git(self.root(), &["add", "-A"])?;
        git(self.root(), &["commit", "-q", "-m", message])
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("git {}", args.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("git {} failed: {status}", args.join(" ")));
    }
    Ok(())
}

/// Engine returning queued results in order.
///
/// The id of each story it is asked to run is taken from the prompt's
/// `STORY:` line and recorded, so tests can assert exactly which stories ran.
pub struct ScriptedEngine {
    queue: RefCell<VecDeque<EngineResult>>,
    repeat: Option<EngineResult>,
    calls: RefCell<Vec<String>>,
    abort_on: Option<(usize, Arc<AtomicBool>)>,
}

impl ScriptedEngine {
    pub fn new(results: Vec<EngineResult>) -> Self {
        Self {
            queue: RefCell::new(results.into()),
            repeat: None,
            calls: RefCell::new(Vec::new()),
            abort_on: None,
        }
    }

    /// Return `result` for every call.
    pub fn always(result: EngineResult) -> Self {
        Self {
            repeat: Some(result),
            ..Self::new(Vec::new())
        }
    }

    /// Raise `flag` during the `call`-th invocation (1-based), like Ctrl-C
    /// arriving while the agent runs.
    pub fn abort_on_call(mut self, call: usize, flag: Arc<AtomicBool>) -> Self {
        self.abort_on = Some((call, flag));
        self
    }

    /// Story ids seen so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let left = self.queue.borrow().len();
        if left > 0 {
            return Err(anyhow!("scripted engine has {left} unused results"));
        }
        Ok(())
    }
}

fn story_id_from_prompt(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("STORY: "))
        .and_then(|rest| rest.split(':').next())
        .unwrap_or("?")
        .to_string()
}

impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(&self, request: &EngineRequest) -> Result<EngineResult, EngineError> {
        self.calls
            .borrow_mut()
            .push(story_id_from_prompt(&request.prompt));
        let call = self.calls.borrow().len();
        if let Some((at, flag)) = &self.abort_on
            && *at == call
        {
            flag.store(true, Ordering::SeqCst);
        }
        let next = self.queue.borrow_mut().pop_front();
        let result = next.or_else(|| self.repeat.clone()).unwrap_or_else(|| {
            panic!("scripted engine exhausted after {call} calls");
        });
        Ok(result)
    }

    fn version(&self, _workdir: &Path) -> Option<String> {
        Some("scripted 1.0".to_string())
    }
}
