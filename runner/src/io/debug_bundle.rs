//! Debug bundle: forensic snapshot written when a run stops unsuccessfully.
//!
//! Every capture is independent. A capture that fails writes its failure
//! message in place of the artifact, and the writer itself never fails.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::io::git::Git;
use crate::io::json::write_json;
use crate::io::run_record::RunRecord;

/// Number of trailing event-log lines copied into the bundle.
pub const EVENTS_TAIL_LINES: usize = 200;

/// Upper bound on how much of the event log is read to find the tail.
pub const EVENTS_TAIL_BYTES: u64 = 1024 * 1024;

/// Inputs for [`write_debug_bundle`].
#[derive(Debug, Clone, Copy)]
pub struct DebugBundleRequest<'a> {
    pub debug_dir: &'a Path,
    pub run: &'a RunRecord,
    pub repo_dir: &'a Path,
    pub events_path: &'a Path,
    pub reason: &'a str,
}

/// What the writer produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugBundleReport {
    pub written: Vec<PathBuf>,
    /// One message per capture or write that failed.
    pub failures: Vec<String>,
}

impl DebugBundleReport {
    fn record(&mut self, path: PathBuf, result: Result<()>) {
        match result {
            Ok(()) => self.written.push(path),
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "debug bundle write failed");
                self.failures.push(format!("{err:#}"));
            }
        }
    }

    /// Substitute a failure message for content that could not be captured.
    fn captured(&mut self, label: &str, result: Result<String>) -> String {
        match result {
            Ok(text) => text,
            Err(err) => {
                let message = format!("failed to {label}: {err:#}");
                self.failures.push(message.clone());
                message
            }
        }
    }
}

/// Last `max_lines` lines of the trimmed text, newline-terminated.
pub fn tail_lines(raw: &str, max_lines: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let mut tail = lines[start..].join("\n");
    tail.push('\n');
    tail
}

/// Tail of the event log. Only the last [`EVENTS_TAIL_BYTES`] are read and
/// bytes that are not UTF-8 are replaced.
pub fn read_events_tail(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let start = len.saturating_sub(EVENTS_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("read {}", path.display()))?;

    let mut raw = String::from_utf8_lossy(&bytes).into_owned();
    if start > 0
        && let Some(newline) = raw.find('\n')
    {
        raw.drain(..=newline);
    }
    Ok(tail_lines(&raw, EVENTS_TAIL_LINES))
}

pub fn write_debug_bundle(request: DebugBundleRequest<'_>) -> DebugBundleReport {
    let mut report = DebugBundleReport::default();
    let dir = request.debug_dir;
    if let Err(err) = fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), err = %err, "create debug bundle dir");
        report
            .failures
            .push(format!("create debug bundle dir {}: {err}", dir.display()));
        return report;
    }

    let run_path = dir.join("run.json");
    let run_written = write_json(&run_path, request.run, "debug run record");
    report.record(run_path, run_written);

    let git = Git::new(request.repo_dir);
    let status = report.captured("get git status", git.status_text());
    let diff = report.captured("get git diff", git.diff_patch());
    write_text(&mut report, dir.join("git-status.txt"), format!("{status}\n"));
    write_text(&mut report, dir.join("git-diff.patch"), format!("{diff}\n"));

    let events = match read_events_tail(request.events_path) {
        Ok(tail) => tail,
        Err(err) => {
            let message = format!("failed to read events: {err:#}");
            report.failures.push(message.clone());
            format!("{message}\n")
        }
    };
    write_text(&mut report, dir.join("events-tail.jsonl"), events);

    let stop_reason = request
        .run
        .stop_reason
        .map_or("unknown", |reason| reason.as_str());
    let summary = format!(
        "# Debug bundle\n\nReason: {}\nStopReason: {stop_reason}\nRun: {}\nCreated: {}\n",
        request.reason, request.run.run_id, request.run.created_at
    );
    write_text(&mut report, dir.join("summary.md"), summary);

    info!(
        dir = %dir.display(),
        written = report.written.len(),
        failures = report.failures.len(),
        "wrote debug bundle"
    );
    report
}

fn write_text(report: &mut DebugBundleReport, path: PathBuf, contents: String) {
    let result = fs::write(&path, contents).with_context(|| format!("write {}", path.display()));
    report.record(path, result);
}
