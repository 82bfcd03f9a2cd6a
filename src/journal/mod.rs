//! Journal reader: spawns the system journal tool and streams normalized
//! records from its newline-JSON output.

use crate::error::{Error, Result};
use crate::models::severity;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::{timeout_at, Instant};

pub const DEFAULT_JOURNALCTL_BIN: &str = "journalctl";

/// Whole-stream deadline; a wedged journal tool must not pin a connection
/// task forever.
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_CURSOR_LEN: usize = 500;

/// One normalized journal record. Absent text fields are empty strings; only
/// the cursor stays optional.
#[derive(Debug, Clone)]
pub struct JournalRecord {
  pub ts: DateTime<Utc>,
  pub hostname: String,
  pub unit: String,
  pub severity: String,
  pub message: String,
  pub cursor: Option<String>,
}

/// Launches the journal tool with a bounded window or resume cursor.
#[derive(Debug, Clone)]
pub struct JournalReader {
  bin: String,
}

impl JournalReader {
  /// Reader using the binary named by `CHIMERA_JOURNALCTL_BIN`, falling back
  /// to `journalctl` on PATH.
  pub fn from_env() -> Self {
    let bin = std::env::var("CHIMERA_JOURNALCTL_BIN")
      .unwrap_or_else(|_| DEFAULT_JOURNALCTL_BIN.to_string());
    Self { bin }
  }

  pub fn with_bin(bin: impl Into<String>) -> Self {
    Self { bin: bin.into() }
  }

  /// Start streaming records. With a cursor the tool resumes after it;
  /// otherwise it reads the trailing window.
  pub async fn stream(
    &self,
    window_seconds: u64,
    max_records: Option<u64>,
    start_cursor: Option<&str>,
  ) -> Result<JournalStream> {
    if let Some(cursor) = start_cursor {
      if !valid_cursor(cursor) {
        return Err(Error::BadRequest("invalid journal cursor".into()));
      }
    }

    let mut cmd = Command::new(&self.bin);
    cmd.arg("--no-pager").arg("-o").arg("json");
    match start_cursor {
      Some(cursor) => {
        cmd.arg("--after-cursor").arg(cursor);
      }
      None => {
        cmd.arg("--since").arg(format!("-{window_seconds}s"));
      }
    }
    if let Some(limit) = max_records {
      cmd.arg("-n").arg(limit.to_string());
    }
    cmd
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let mut child = cmd
      .spawn()
      .map_err(|e| Error::JournalUnavailable(format!("failed to launch {}: {e}", self.bin)))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| Error::JournalUnavailable("journal tool has no stdout".into()))?;

    Ok(JournalStream {
      child,
      lines: BufReader::new(stdout).lines(),
      remaining: max_records,
      deadline: Instant::now() + STREAM_TIMEOUT,
      emitted: 0,
      malformed: 0,
      missing_ts: 0,
      done: false,
    })
  }
}

/// Finite lazy sequence of journal records.
pub struct JournalStream {
  child: Child,
  lines: Lines<BufReader<ChildStdout>>,
  remaining: Option<u64>,
  deadline: Instant,
  emitted: u64,
  /// Lines that were not valid JSON, skipped.
  pub malformed: u64,
  /// Records without a usable timestamp, skipped.
  pub missing_ts: u64,
  done: bool,
}

impl JournalStream {
  /// Next normalized record, or `None` at end of stream. Malformed lines and
  /// records without a timestamp are skipped and counted, never surfaced.
  pub async fn next_record(&mut self) -> Result<Option<JournalRecord>> {
    if self.done {
      return Ok(None);
    }
    if self.remaining == Some(0) {
      self.done = true;
      return Ok(None);
    }
    loop {
      let line = match timeout_at(self.deadline, self.lines.next_line()).await {
        Ok(read) => read?,
        Err(_) => {
          self.done = true;
          let _ = self.child.start_kill();
          return Err(Error::JournalUnavailable("journal tool timed out".into()));
        }
      };
      let Some(line) = line else {
        self.done = true;
        return self.finish().await;
      };
      let trimmed = line.trim();
      if trimmed.is_empty() {
        continue;
      }
      let entry: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => {
          self.malformed += 1;
          tracing::warn!("skipping malformed journal line: {e}");
          continue;
        }
      };
      match parse_record(&entry) {
        Some(record) => {
          self.emitted += 1;
          if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
          }
          return Ok(Some(record));
        }
        None => {
          self.missing_ts += 1;
          tracing::debug!("skipping journal record without usable timestamp");
        }
      }
    }
  }

  /// EOF: reap the child. A non-zero exit after records were emitted leaves
  /// those records standing; with nothing emitted it means the tool itself is
  /// unusable.
  async fn finish(&mut self) -> Result<Option<JournalRecord>> {
    let status = self.child.wait().await?;
    if status.success() {
      return Ok(None);
    }
    if self.emitted == 0 {
      let mut detail = String::new();
      if let Some(mut stderr) = self.child.stderr.take() {
        let _ = stderr.read_to_string(&mut detail).await;
      }
      let detail = detail.lines().next().unwrap_or("").trim();
      return Err(Error::JournalUnavailable(format!(
        "journal tool exited with {status}: {detail}"
      )));
    }
    tracing::warn!(
      emitted = self.emitted,
      "journal tool exited with {status} mid-stream"
    );
    Ok(None)
  }
}

/// Normalize one journald JSON object. `None` when the record carries no
/// parseable `__REALTIME_TIMESTAMP`; such records are never assigned `now`.
fn parse_record(entry: &Value) -> Option<JournalRecord> {
  let ts = parse_realtime_timestamp(entry.get("__REALTIME_TIMESTAMP"))?;
  let hostname = text_field(entry, "_HOSTNAME");
  let mut unit = text_field(entry, "_SYSTEMD_UNIT");
  if unit.is_empty() {
    unit = text_field(entry, "SYSLOG_IDENTIFIER");
  }
  let severity = match entry.get("PRIORITY").and_then(json_text) {
    Some(priority) => severity::from_priority(&priority)
      .map(str::to_string)
      .unwrap_or(priority),
    None => String::new(),
  };
  let message = text_field(entry, "MESSAGE");
  let cursor = entry.get("__CURSOR").and_then(json_text);
  Some(JournalRecord {
    ts,
    hostname,
    unit,
    severity,
    message,
    cursor,
  })
}

/// `__REALTIME_TIMESTAMP` is microseconds since the epoch, as a string.
fn parse_realtime_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
  let micros: i64 = match value? {
    Value::String(s) => s.parse().ok()?,
    Value::Number(n) => n.as_i64()?,
    _ => return None,
  };
  Utc.timestamp_micros(micros).single()
}

fn text_field(entry: &Value, key: &str) -> String {
  entry.get(key).and_then(json_text).unwrap_or_default()
}

fn json_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Journald cursors are `key=value` runs with a restricted charset; anything
/// else is rejected before it reaches the tool's argument list.
fn valid_cursor(cursor: &str) -> bool {
  !cursor.is_empty()
    && cursor.len() <= MAX_CURSOR_LEN
    && cursor
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || "+/=_-;.".contains(c))
}
