//! Runner configuration stored under `.storyrunner/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::io::engine::claude::DEFAULT_MODEL;
use crate::io::engine::{DEFAULT_ENGINE_TIMEOUT, EngineKind, Stage};
use crate::io::json::write_atomic;

pub const CONFIG_DIR: &str = ".storyrunner";
pub const CONFIG_FILE: &str = "config.toml";

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wall-clock limit for one engine call, in seconds.
    pub engine_timeout_secs: u64,

    /// Bound on engine stdout kept in memory for parsing.
    pub output_limit_bytes: usize,

    /// Where run directories live (`<runs_home>/runs/<run_id>`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runs_home: Option<PathBuf>,

    /// Model passed to `claude --model`.
    pub claude_model: String,

    pub defaults: DefaultsConfig,

    pub stages: StagesConfig,
}

/// Defaults for CLI flags that were not given explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub sandbox: bool,
    pub ask_for_approval: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            sandbox: true,
            ask_for_approval: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work: Option<StageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<StageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<StageConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine_timeout_secs: DEFAULT_ENGINE_TIMEOUT.as_secs(),
            output_limit_bytes: 10 * 1024 * 1024,
            runs_home: None,
            claude_model: DEFAULT_MODEL.to_string(),
            defaults: DefaultsConfig::default(),
            stages: StagesConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine_timeout_secs == 0 {
            return Err(anyhow!("engine_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.claude_model.trim().is_empty() {
            return Err(anyhow!("claude_model must be non-empty"));
        }
        if self
            .runs_home
            .as_ref()
            .is_some_and(|home| home.as_os_str().is_empty())
        {
            return Err(anyhow!("runs_home must be non-empty when set"));
        }
        Ok(())
    }

    /// Engine configured for `stage`, falling back to the stage default.
    pub fn stage_engine(&self, stage: Stage) -> EngineKind {
        let configured = match stage {
            Stage::Work => self.stages.work.as_ref(),
            Stage::Plan => self.stages.plan.as_ref(),
            Stage::Review => self.stages.review.as_ref(),
        };
        configured
            .and_then(|stage_cfg| stage_cfg.engine)
            .unwrap_or_else(|| stage.default_engine())
    }
}

/// `<repo_root>/.storyrunner/config.toml`.
pub fn config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf, "config")
}

/// Result of `storyrunner init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub path: PathBuf,
    pub created: bool,
}

/// Write the default config unless one exists (or `force` is set).
///
/// The config directory is git-ignored so initializing does not dirty the
/// worktree.
pub fn init_config(repo_root: &Path, force: bool) -> Result<InitOutcome> {
    let path = config_path(repo_root);
    let created = force || !path.exists();
    if created {
        write_config(&path, &RunnerConfig::default())?;
        info!(path = %path.display(), force, "wrote default config");
    }
    let gitignore = repo_root.join(CONFIG_DIR).join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, "*\n")
            .with_context(|| format!("write {}", gitignore.display()))?;
    }
    Ok(InitOutcome { path, created })
}
