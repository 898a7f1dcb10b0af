//! Identity-based checkpoint state and next-story selection.
//!
//! The checkpoint is the single source of truth for completion. Progress is
//! tracked by story id, never by position: the next story is always the
//! first story in declared order whose id is not in the completed set.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::prd::{Prd, Story};

/// Persisted checkpoint (`checkpoints/state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointState {
    pub contract_version: String,
    pub run_id: String,
    /// Positional progress kept for older readers. Never used to select work.
    pub current_story_index: usize,
    pub completed_story_ids: Vec<String>,
    /// `None` means "recompute from the task list and completed set".
    #[serde(default)]
    pub next_story_id: Option<String>,
    pub updated_at: String,
}

impl CheckpointState {
    pub fn new(contract_version: &str, run_id: &str, updated_at: String) -> Self {
        Self {
            contract_version: contract_version.to_string(),
            run_id: run_id.to_string(),
            current_story_index: 0,
            completed_story_ids: Vec::new(),
            next_story_id: None,
            updated_at,
        }
    }

    pub fn is_completed(&self, story_id: &str) -> bool {
        self.completed_story_ids.iter().any(|id| id == story_id)
    }

    /// Record a completed story. The completed set only grows.
    pub fn mark_completed(&mut self, story_id: &str) {
        if !self.is_completed(story_id) {
            self.completed_story_ids.push(story_id.to_string());
        }
    }

    /// Point the checkpoint at the story about to run.
    pub fn mark_about_to_run(&mut self, prd: &Prd, story_id: &str) {
        self.next_story_id = Some(story_id.to_string());
        self.current_story_index = prd.position_of(story_id).unwrap_or(prd.stories.len());
    }

    /// Recompute `next_story_id` and the legacy index from the completed set.
    pub fn refresh_next(&mut self, prd: &Prd) {
        match next_story(prd, &self.completed_story_ids) {
            Some((idx, story)) => {
                self.next_story_id = Some(story.id.clone());
                self.current_story_index = idx;
            }
            None => {
                self.next_story_id = None;
                self.current_story_index = prd.stories.len();
            }
        }
    }
}

/// First story (in declared order) whose id is not completed, with its index.
pub fn next_story<'a>(prd: &'a Prd, completed: &[String]) -> Option<(usize, &'a Story)> {
    let done: HashSet<&str> = completed.iter().map(String::as_str).collect();
    prd.stories
        .iter()
        .enumerate()
        .find(|(_, story)| !done.contains(story.id.as_str()))
}

/// Id of the next story to run, or `None` when the task list is exhausted.
pub fn next_story_id(prd: &Prd, completed: &[String]) -> Option<String> {
    next_story(prd, completed).map(|(_, story)| story.id.clone())
}

/// One-shot upgrade of an index-only checkpoint to the identity-based form.
///
/// When the completed set is empty but the legacy index is positive, every
/// story before that index is assumed complete. Otherwise the completed set
/// is kept as-is. Either way `next_story_id` is derived fresh.
pub fn migrate(legacy: CheckpointState, prd: &Prd) -> CheckpointState {
    let mut state = legacy;
    if state.completed_story_ids.is_empty() && state.current_story_index > 0 {
        let upto = state.current_story_index.min(prd.stories.len());
        state.completed_story_ids = prd.stories[..upto]
            .iter()
            .map(|story| story.id.clone())
            .collect();
    }
    state.refresh_next(prd);
    state
}
