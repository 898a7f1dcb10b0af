//! Task-list loading: schema + policy validation and content hashing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::policy::validate_policy;
use crate::io::run_record::PrdSnapshot;
use crate::prd::Prd;

const PRD_SCHEMA: &str = include_str!("../../schemas/prd/v0.1.schema.json");

/// A validated task list and the digest of the exact bytes it was read from.
#[derive(Debug, Clone)]
pub struct LoadedPrd {
    pub path: PathBuf,
    pub prd: Prd,
    pub sha256: String,
}

impl LoadedPrd {
    pub fn snapshot(&self) -> PrdSnapshot {
        PrdSnapshot {
            schema_version: self.prd.schema_version.clone(),
            title: self.prd.title.clone(),
            story_count: self.prd.stories.len(),
            sha256: self.sha256.clone(),
        }
    }
}

/// Outcome of checking a task-list file that could be read.
#[derive(Debug, Clone)]
pub enum PrdCheck {
    Valid(LoadedPrd),
    Invalid { sha256: String, errors: Vec<String> },
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Read and check a task list. Only a read failure is an `Err`.
pub fn check_prd(path: &Path) -> Result<PrdCheck> {
    let bytes = fs::read(path).with_context(|| format!("read task list {}", path.display()))?;
    let sha256 = sha256_hex(&bytes);
    debug!(path = %path.display(), sha256 = %sha256, "checking task list");

    let check = match parse_and_validate(&bytes) {
        Ok(prd) => PrdCheck::Valid(LoadedPrd {
            path: path.to_path_buf(),
            prd,
            sha256,
        }),
        Err(errors) => {
            warn!(path = %path.display(), count = errors.len(), "task list rejected");
            PrdCheck::Invalid { sha256, errors }
        }
    };
    Ok(check)
}

/// Load a task list, failing with every violation listed.
pub fn load_prd(path: &Path) -> Result<LoadedPrd> {
    match check_prd(path)? {
        PrdCheck::Valid(loaded) => Ok(loaded),
        PrdCheck::Invalid { errors, .. } => bail!(
            "invalid task list {}:\n- {}",
            path.display(),
            errors.join("\n- ")
        ),
    }
}

fn parse_and_validate(bytes: &[u8]) -> std::result::Result<Prd, Vec<String>> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| vec![format!("invalid JSON: {err}")])?;

    let schema_errors = schema_errors(&value).map_err(|err| vec![format!("{err:#}")])?;
    if !schema_errors.is_empty() {
        return Err(schema_errors);
    }

    let prd: Prd = serde_json::from_value(value)
        .map_err(|err| vec![format!("deserialize task list: {err}")])?;

    let policy_errors = validate_policy(&prd);
    if !policy_errors.is_empty() {
        return Err(policy_errors);
    }
    Ok(prd)
}

/// Validate a JSON instance against the task-list schema (Draft 2020-12).
pub fn schema_errors(instance: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(PRD_SCHEMA).context("parse task list schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile task list schema")?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| format!("schema: {err}"))
        .collect())
}
