//! Checkpoint Store: durable load/save of `checkpoints/state.json`.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::checkpoint::{CheckpointState, migrate};
use crate::io::json::{read_json, write_json};
use crate::io::run_record::now_timestamp;
use crate::prd::Prd;

pub fn load_checkpoint(path: &Path) -> Result<CheckpointState> {
    debug!(path = %path.display(), "loading checkpoint");
    read_json(path, "checkpoint")
}

/// Stamp `updated_at` and write atomically (temp file + rename).
pub fn save_checkpoint(path: &Path, state: &CheckpointState) -> Result<()> {
    let mut stamped = state.clone();
    stamped.updated_at = now_timestamp();
    debug!(
        path = %path.display(),
        completed = stamped.completed_story_ids.len(),
        next = ?stamped.next_story_id,
        "writing checkpoint"
    );
    write_json(path, &stamped, "checkpoint")
}

/// Load the checkpoint for `prd`, upgrading a legacy (index-only) file once.
///
/// A file without a `next_story_id` key is legacy: it is migrated and the
/// migrated form is persisted before returning, so migration never repeats.
pub fn load_checkpoint_for(path: &Path, prd: &Prd) -> Result<CheckpointState> {
    let raw: Value = read_json(path, "checkpoint")?;
    let is_legacy = raw
        .as_object()
        .is_some_and(|object| !object.contains_key("next_story_id"));
    let state: CheckpointState = serde_json::from_value(raw)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    if !is_legacy {
        return Ok(state);
    }

    let migrated = migrate(state, prd);
    info!(
        path = %path.display(),
        completed = migrated.completed_story_ids.len(),
        next = ?migrated.next_story_id,
        "migrated legacy checkpoint"
    );
    save_checkpoint(path, &migrated)?;
    Ok(migrated)
}
