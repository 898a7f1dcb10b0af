//! Shared deterministic types for runner core logic.
//!
//! These types define stable contracts between core components and the
//! persisted run layout. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of reasons a run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    Success,
    DirtyWorktree,
    NotAGitRepo,
    ValidationFailed,
    EngineError,
    ApprovalDenied,
    UserAbort,
    UnknownError,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Success => "SUCCESS",
            StopReason::DirtyWorktree => "DIRTY_WORKTREE",
            StopReason::NotAGitRepo => "NOT_A_GIT_REPO",
            StopReason::ValidationFailed => "VALIDATION_FAILED",
            StopReason::EngineError => "ENGINE_ERROR",
            StopReason::ApprovalDenied => "APPROVAL_DENIED",
            StopReason::UserAbort => "USER_ABORT",
            StopReason::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent-declared status for a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Ok,
    NeedsHuman,
    Failed,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 3] = [AgentStatus::Ok, AgentStatus::NeedsHuman, AgentStatus::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Ok => "ok",
            AgentStatus::NeedsHuman => "needs_human",
            AgentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }
}

/// Structured envelope an agent returns for one story.
///
/// Only `status` and `summary` are load-bearing; the lists are informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub status: AgentStatus,
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tests_run: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}
