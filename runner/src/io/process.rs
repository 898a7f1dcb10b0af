//! Helpers for running child processes with timeouts and bounded output.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::engine::EngineError;

/// Maximum number of stderr characters kept from a streaming child.
pub const STDERR_TAIL_CHARS: usize = 4000;

/// Interval at which a running agent is checked for an abort request.
const ABORT_POLL: Duration = Duration::from_millis(100);

/// How long output readers may lag behind a reaped agent.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        truncated += append_limited(&mut buf, &chunk[..n], limit);
    }

    Ok((buf, truncated))
}

/// Append up to `limit` total bytes, returning how many were dropped.
fn append_limited(buf: &mut Vec<u8>, bytes: &[u8], limit: usize) -> usize {
    let remaining = limit.saturating_sub(buf.len());
    let keep = bytes.len().min(remaining);
    buf.extend_from_slice(&bytes[..keep]);
    bytes.len() - keep
}

/// Incremental JSONL parser for an agent event stream.
///
/// Partial lines are carried across chunk boundaries and only complete lines
/// are parsed. Lines that are not JSON are skipped.
#[derive(Debug, Default)]
pub struct JsonlScanner {
    carry: Vec<u8>,
    last_json: Option<Value>,
    last_agent_json: Option<Value>,
    parsed_lines: usize,
    skipped_lines: usize,
}

impl JsonlScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of stdout.
    pub fn push(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
        while let Some(pos) = self.carry.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            self.scan_line(&line);
        }
    }

    /// Flush the trailing line (a final record without a newline).
    pub fn finish(&mut self) {
        let rest = std::mem::take(&mut self.carry);
        self.scan_line(&rest);
    }

    /// Last JSON value seen on any line.
    pub fn last_json(&self) -> Option<&Value> {
        self.last_json.as_ref()
    }

    /// Last JSON payload carried inside an agent-message event.
    pub fn last_agent_json(&self) -> Option<&Value> {
        self.last_agent_json.as_ref()
    }

    pub fn parsed_lines(&self) -> usize {
        self.parsed_lines
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    fn scan_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                self.parsed_lines += 1;
                if let Some(payload) = agent_message_payload(&value) {
                    self.last_agent_json = Some(payload);
                }
                self.last_json = Some(value);
            }
            Err(_) => self.skipped_lines += 1,
        }
    }
}

/// Extract the JSON payload of an agent-message event, if `value` is one.
///
/// Accepts `{"type":"agent_message","text":..}` as well as the nested
/// `item`/`msg` envelopes newer agent CLIs emit.
fn agent_message_payload(value: &Value) -> Option<Value> {
    let candidates = [
        Some(value),
        value.get("item"),
        value.get("msg"),
    ];
    candidates.into_iter().flatten().find_map(|event| {
        if event.get("type").and_then(Value::as_str) != Some("agent_message") {
            return None;
        }
        let text = event
            .get("text")
            .or_else(|| event.get("message"))
            .and_then(Value::as_str)?;
        serde_json::from_str(text.trim()).ok()
    })
}

/// Keep only the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Inputs for [`run_streaming`].
#[derive(Debug, Clone, Copy)]
pub struct StreamRequest<'a> {
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<&'a [u8]>,
    /// Stdout is appended here verbatim, in arrival order.
    pub events_path: &'a Path,
    pub timeout: Duration,
    /// Polled while waiting; the agent is killed once it is set.
    pub abort: Option<&'a AtomicBool>,
    /// Bound on stdout kept in memory; the event log always gets everything.
    pub stdout_limit_bytes: usize,
}

/// Result of a streamed child process.
#[derive(Debug)]
pub struct StreamOutcome {
    /// Non-zero whenever the child was killed, signalled or timed out.
    pub exit_code: i32,
    pub signal: Option<String>,
    pub timed_out: bool,
    pub stderr_tail: String,
    /// Bounded copy of stdout.
    pub stdout: String,
    pub scanner: JsonlScanner,
}

/// Run an agent subprocess, teeing stdout into the event log while scanning it as JSONL.
///
/// Only spawn and pipe setup failures are errors; everything that happens
/// after the child starts is reported through [`StreamOutcome`].
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = request.timeout.as_secs()))]
pub fn run_streaming(
    mut cmd: Command,
    request: StreamRequest<'_>,
) -> Result<StreamOutcome, EngineError> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let events = OpenOptions::new()
        .create(true)
        .append(true)
        .open(request.events_path)
        .map_err(|source| EngineError::Io {
            context: format!("open event log {}", request.events_path.display()),
            source,
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.stdin(if request.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    debug!("spawning agent process");
    let mut child = cmd.spawn().map_err(|source| {
        error!(err = %source, program = %program, "failed to spawn agent");
        EngineError::Spawn {
            program: program.clone(),
            source,
        }
    })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(EngineError::Io {
            context: "take agent pipes".to_string(),
            source: std::io::Error::other("stdout/stderr were not piped"),
        });
    };

    let pid = child.id();
    let (tx, rx) = mpsc::channel();
    let stdout_tx = tx.clone();
    let limit = request.stdout_limit_bytes;
    thread::spawn(move || {
        let _ = stdout_tx.send(Drained::Stdout(drain_stdout(stdout, events, limit)));
    });
    thread::spawn(move || {
        let _ = tx.send(Drained::Stderr(drain_stderr_tail(stderr)));
    });

    if let (Some(input), Some(child_stdin)) = (request.stdin, child.stdin.take()) {
        let input = input.to_vec();
        thread::spawn(move || feed_stdin(child_stdin, &input));
    }

    let mut timed_out = false;
    let deadline = Instant::now() + request.timeout;
    let waited = loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match child.wait_timeout(left.min(ABORT_POLL)) {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                let aborted = request.abort.is_some_and(|flag| flag.load(Ordering::SeqCst));
                if aborted {
                    warn!("abort requested, killing agent");
                } else if left <= ABORT_POLL {
                    warn!(
                        timeout_secs = request.timeout.as_secs(),
                        "agent timed out, killing"
                    );
                    timed_out = true;
                } else {
                    continue;
                }
                if !kill_process_group(pid)
                    && let Err(e) = child.kill()
                {
                    warn!(err = %e, "failed to kill agent");
                }
                break child.wait();
            }
            Err(e) => break Err(e),
        }
    };
    let status = waited.map_err(|source| EngineError::Io {
        context: "wait for agent".to_string(),
        source,
    })?;

    // Descendants that inherited the pipes keep the readers alive after the
    // child is reaped; they get a grace period and then the group is killed.
    let mut drains = Drains::default();
    drains.collect(&rx, DRAIN_GRACE);
    if !drains.is_complete() {
        warn!("agent descendants still hold its output pipes, killing process group");
        kill_process_group(pid);
        drains.collect(&rx, DRAIN_GRACE);
    }
    if !drains.is_complete() {
        warn!("abandoning agent output readers");
    }
    let (scanner, stdout) = drains.stdout.unwrap_or_else(|| (JsonlScanner::new(), Vec::new()));
    let stderr_tail = drains.stderr.unwrap_or_default();

    let signal = signal_name(&status);
    let exit_code = match status.code() {
        Some(code) if timed_out && code == 0 => 1,
        Some(code) => code,
        None => 1,
    };

    debug!(
        exit_code,
        signal = ?signal,
        timed_out,
        parsed_lines = scanner.parsed_lines(),
        skipped_lines = scanner.skipped_lines(),
        "agent finished"
    );
    Ok(StreamOutcome {
        exit_code,
        signal,
        timed_out,
        stderr_tail,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        scanner,
    })
}

enum Drained {
    Stdout((JsonlScanner, Vec<u8>)),
    Stderr(String),
}

#[derive(Default)]
struct Drains {
    stdout: Option<(JsonlScanner, Vec<u8>)>,
    stderr: Option<String>,
}

impl Drains {
    fn is_complete(&self) -> bool {
        self.stdout.is_some() && self.stderr.is_some()
    }

    /// Receive reader results until both arrived, the grace period ends or
    /// every reader is gone.
    fn collect(&mut self, rx: &Receiver<Drained>, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.is_complete() {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(Drained::Stdout(out)) => self.stdout = Some(out),
                Ok(Drained::Stderr(tail)) => self.stderr = Some(tail),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("agent output reader exited without a result");
                    break;
                }
            }
        }
    }
}

fn feed_stdin(mut stdin: ChildStdin, input: &[u8]) {
    match stdin.write_all(input) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            warn!("agent closed stdin before reading the full prompt");
        }
        Err(e) => warn!(err = %e, "failed to write agent stdin"),
    }
}

/// SIGKILL the child's process group. Returns false when nothing was signalled.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(err = %e, pid, "failed to kill agent process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> bool {
    false
}

fn drain_stdout<R: Read>(mut reader: R, mut events: File, limit: usize) -> (JsonlScanner, Vec<u8>) {
    let mut scanner = JsonlScanner::new();
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut log_ok = true;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(err = %e, "failed to read agent stdout");
                break;
            }
        };
        let bytes = &chunk[..n];
        if log_ok && let Err(e) = events.write_all(bytes) {
            warn!(err = %e, "failed to append to event log");
            log_ok = false;
        }
        scanner.push(bytes);
        dropped += append_limited(&mut kept, bytes, limit);
    }
    scanner.finish();

    if let Err(e) = events.flush() {
        warn!(err = %e, "failed to flush event log");
    }
    if dropped > 0 {
        warn!(dropped, "agent stdout truncated in memory");
    }
    (scanner, kept)
}

fn drain_stderr_tail<R: Read>(mut reader: R) -> String {
    let mut tail = String::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                tail.push_str(&String::from_utf8_lossy(&chunk[..n]));
                if tail.len() > STDERR_TAIL_CHARS * 4 {
                    tail = tail_chars(&tail, STDERR_TAIL_CHARS);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(err = %e, "failed to read agent stderr");
                break;
            }
        }
    }
    tail_chars(&tail, STDERR_TAIL_CHARS)
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let name = match status.signal()? {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    };
    Some(name)
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Verifies a record split across chunks is parsed once complete.
    #[test]
    fn scanner_joins_records_across_chunks() {
        let mut scanner = JsonlScanner::new();
        scanner.push(b"{\"type\":\"ev");
        assert!(scanner.last_json().is_none());
        scanner.push(b"ent\"}\nnoise line\n{\"status\":");
        assert_eq!(scanner.last_json(), Some(&json!({"type": "event"})));
        scanner.push(b"\"ok\",\"summary\":\"s\"}");
        scanner.finish();

        assert_eq!(
            scanner.last_json(),
            Some(&json!({"status": "ok", "summary": "s"}))
        );
        assert_eq!(scanner.parsed_lines(), 2);
        assert_eq!(scanner.skipped_lines(), 1);
    }

    #[test]
    fn scanner_extracts_agent_message_payloads() {
        let mut scanner = JsonlScanner::new();
        let flat = json!({"type": "agent_message", "text": "{\"status\":\"ok\",\"summary\":\"a\"}"});
        let nested = json!({"type": "item.completed", "item": {"type": "agent_message", "text": "{\"status\":\"failed\",\"summary\":\"b\"}"}});
        let prose = json!({"type": "agent_message", "text": "all done"});
        for event in [flat, nested, prose] {
            scanner.push(format!("{event}\n").as_bytes());
        }

        assert_eq!(
            scanner.last_agent_json(),
            Some(&json!({"status": "failed", "summary": "b"}))
        );
        assert_eq!(scanner.last_json().and_then(|v| v["text"].as_str()), Some("all done"));
    }

    #[test]
    fn scanner_ignores_invalid_trailing_fragment() {
        let mut scanner = JsonlScanner::new();
        scanner.push(b"{\"status\":\n");
        scanner.finish();
        assert!(scanner.last_json().is_none());
        assert_eq!(scanner.skipped_lines(), 1);
    }

    #[test]
    fn tail_chars_keeps_suffix() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[test]
    fn append_limited_counts_dropped_bytes() {
        let mut buf = Vec::new();
        assert_eq!(append_limited(&mut buf, b"abcd", 3), 1);
        assert_eq!(append_limited(&mut buf, b"ef", 3), 2);
        assert_eq!(buf, b"abc");
    }
}
