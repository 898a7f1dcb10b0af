//! Product log (`logs.jsonl`) for a run.
//!
//! Unlike `tracing` output this is always written and lives in the run
//! directory. Appends are best-effort: a logging failure never breaks a run.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::io::run_record::now_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    ts: String,
    level: LogLevel,
    event: &'a str,
    run_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

/// Appends structured entries to a run's `logs.jsonl`.
#[derive(Debug, Clone)]
pub struct RunLogger {
    path: PathBuf,
    run_id: String,
}

impl RunLogger {
    pub fn new(path: &Path, run_id: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
        }
    }

    pub fn info(&self, event: &str, message: Option<&str>, data: Option<&Value>) {
        self.log(LogLevel::Info, event, message, data);
    }

    pub fn warn(&self, event: &str, message: Option<&str>, data: Option<&Value>) {
        self.log(LogLevel::Warn, event, message, data);
    }

    pub fn error(&self, event: &str, message: Option<&str>, data: Option<&Value>) {
        self.log(LogLevel::Error, event, message, data);
    }

    pub fn log(&self, level: LogLevel, event: &str, message: Option<&str>, data: Option<&Value>) {
        let entry = LogEntry {
            ts: now_timestamp(),
            level,
            event,
            run_id: &self.run_id,
            message,
            data,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(err = %err, event, "serialize run log entry");
                return;
            }
        };
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = appended {
            warn!(err = %err, path = %self.path.display(), event, "append run log");
        }
    }
}
