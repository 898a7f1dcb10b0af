//! Per-story artifacts and the completion marker under `artifacts/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::io::engine::EngineResult;
use crate::io::json::write_json;
use crate::prd::Story;

pub const COMPLETION_MARKER: &str = "completed.txt";

/// Forensic record of one engine call for one story.
#[derive(Debug, Clone, Serialize)]
pub struct StoryArtifact<'a> {
    pub story: &'a Story,
    pub engine: &'a str,
    pub exit_code: i32,
    pub signal: Option<&'a str>,
    pub timed_out: bool,
    pub final_output: Option<&'a Value>,
    pub stderr_tail: &'a str,
    /// Structured-output violations (empty when the envelope was valid or never checked).
    pub contract_errors: &'a [String],
    pub written_at: String,
}

impl<'a> StoryArtifact<'a> {
    pub fn new(
        story: &'a Story,
        engine: &'a str,
        result: &'a EngineResult,
        contract_errors: &'a [String],
        written_at: String,
    ) -> Self {
        Self {
            story,
            engine,
            exit_code: result.exit_code,
            signal: result.signal.as_deref(),
            timed_out: result.timed_out,
            final_output: result.final_output.as_ref(),
            stderr_tail: &result.stderr_tail,
            contract_errors,
            written_at,
        }
    }
}

/// `story-<1-based index>-<id with unsafe characters replaced>.json`.
pub fn story_artifact_name(index: usize, story_id: &str) -> String {
    let safe: String = story_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("story-{}-{safe}.json", index + 1)
}

pub fn write_story_artifact(
    artifacts_dir: &Path,
    index: usize,
    artifact: &StoryArtifact<'_>,
) -> Result<PathBuf> {
    let path = artifacts_dir.join(story_artifact_name(index, &artifact.story.id));
    write_json(&path, artifact, "story artifact")?;
    debug!(path = %path.display(), "wrote story artifact");
    Ok(path)
}

/// Marker written once every story is complete.
pub fn write_completion_marker(artifacts_dir: &Path) -> Result<PathBuf> {
    let path = artifacts_dir.join(COMPLETION_MARKER);
    fs::write(&path, "completed\n")
        .with_context(|| format!("write completion marker {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::story;

    #[test]
    fn artifact_name_sanitizes_ids() {
        assert_eq!(story_artifact_name(0, "S1"), "story-1-S1.json");
        assert_eq!(story_artifact_name(2, "a/b c"), "story-3-a_b_c.json");
        assert_eq!(story_artifact_name(4, "../x"), "story-5-.._x.json");
    }

    #[test]
    fn writes_artifact_with_engine_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let story = story("S1");
        let result = EngineResult {
            exit_code: 3,
            signal: None,
            final_output: Some(serde_json::json!({"status": "ok"})),
            stderr_tail: "boom".to_string(),
            timed_out: false,
        };
        let errors = vec!["missing summary".to_string()];
        let artifact = StoryArtifact::new(&story, "fake", &result, &errors, "t".to_string());

        let path = write_story_artifact(temp.path(), 0, &artifact).expect("write");
        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["story"]["id"], "S1");
        assert_eq!(raw["exit_code"], 3);
        assert_eq!(raw["signal"], Value::Null);
        assert_eq!(raw["final_output"]["status"], "ok");
        assert_eq!(raw["contract_errors"][0], "missing summary");
    }

    #[test]
    fn completion_marker_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_completion_marker(temp.path()).expect("write");
        assert_eq!(fs::read_to_string(path).expect("read"), "completed\n");
    }
}
