//! `storyrunner validate`: check a task list without starting a run.

use std::path::Path;

use anyhow::Result;

use crate::io::prd_store::{PrdCheck, check_prd};

/// Validation result for one task-list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateReport {
    pub sha256: String,
    pub story_count: Option<usize>,
    /// Schema, policy or parse violations (empty when valid).
    pub errors: Vec<String>,
}

impl ValidateReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// `ok` or one violation per line, prefixed with `- `.
    pub fn render(&self) -> String {
        if self.is_ok() {
            return "ok".to_string();
        }
        self.errors
            .iter()
            .map(|err| format!("- {err}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Validate the task list at `path`. Only an unreadable file is an `Err`.
pub fn validate_prd_file(path: &Path) -> Result<ValidateReport> {
    let report = match check_prd(path)? {
        PrdCheck::Valid(loaded) => ValidateReport {
            story_count: Some(loaded.prd.stories.len()),
            sha256: loaded.sha256,
            errors: Vec::new(),
        },
        PrdCheck::Invalid { sha256, errors } => ValidateReport {
            sha256,
            story_count: None,
            errors,
        },
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{prd_with_ids, write_prd};

    #[test]
    fn valid_task_list_renders_ok() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_prd(temp.path(), &prd_with_ids(&["S1", "S2"]));
        let report = validate_prd_file(&path).expect("validate");
        assert!(report.is_ok());
        assert_eq!(report.story_count, Some(2));
        assert_eq!(report.render(), "ok");
    }

    #[test]
    fn violations_render_one_per_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ids: Vec<String> = (0..11).map(|i| format!("S{i}")).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let path = write_prd(temp.path(), &prd_with_ids(&ids));

        let report = validate_prd_file(&path).expect("validate");
        assert!(!report.is_ok());
        assert_eq!(report.render(), "- too many stories (max 10, got 11)");
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_prd_file(&temp.path().join("missing.json")).unwrap_err();
        assert!(format!("{err:#}").contains("read task list"));
    }
}
