//! Log entry records: normalized insert form, database row, and API shape.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;

/// Field separator for the fingerprint input. Control characters cannot occur
/// in journal text fields, so joined tuples never collide.
const FIELD_SEP: char = '\u{1f}';

/// Timestamp layout hashed into the fingerprint; fixed microsecond width so
/// the canonical string is identical across runs and hosts.
const CANONICAL_TS: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// A normalized record ready for insertion, identity already derived.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
  pub id: i64,
  pub ts: DateTime<Utc>,
  pub hostname: String,
  pub unit: String,
  pub source: String,
  pub severity: String,
  pub message: String,
  pub cursor: Option<String>,
  pub fingerprint: String,
}

impl NewLogEntry {
  pub fn new(
    ts: DateTime<Utc>,
    hostname: String,
    unit: String,
    source: String,
    severity: String,
    message: String,
    cursor: Option<String>,
  ) -> Self {
    let digest = Sha256::digest(
      canonical_tuple(&ts, &hostname, &unit, &source, &severity, &message).as_bytes(),
    );
    let fingerprint = format!("{digest:x}");
    let id = id_from_digest(&digest);
    Self {
      id,
      ts,
      hostname,
      unit,
      source,
      severity,
      message,
      cursor,
      fingerprint,
    }
  }
}

/// Database row returned by log queries.
#[derive(Debug, FromRow)]
pub struct LogRow {
  pub id: i64,
  pub ts: DateTime<Utc>,
  pub hostname: String,
  pub unit: String,
  pub source: String,
  pub severity: String,
  pub message: String,
}

/// Wire shape of a queried row; timestamps rendered as ISO-8601 UTC.
#[derive(Debug, Serialize)]
pub struct ApiLogRow {
  pub id: i64,
  pub ts: String,
  pub hostname: String,
  pub unit: String,
  pub source: String,
  pub severity: String,
  pub message: String,
}

impl From<LogRow> for ApiLogRow {
  fn from(r: LogRow) -> Self {
    ApiLogRow {
      id: r.id,
      ts: r.ts.format(CANONICAL_TS).to_string(),
      hostname: r.hostname,
      unit: r.unit,
      source: r.source,
      severity: r.severity,
      message: r.message,
    }
  }
}

fn canonical_tuple(
  ts: &DateTime<Utc>,
  hostname: &str,
  unit: &str,
  source: &str,
  severity: &str,
  message: &str,
) -> String {
  let ts = ts.format(CANONICAL_TS);
  let mut out = format!("{ts}");
  for field in [hostname, unit, source, severity, message] {
    out.push(FIELD_SEP);
    out.push_str(field);
  }
  out
}

/// First 8 digest bytes as a big-endian integer, sign bit cleared so the value
/// fits a signed 64-bit column.
fn id_from_digest(digest: &[u8]) -> i64 {
  let mut first8 = [0u8; 8];
  first8.copy_from_slice(&digest[..8]);
  (u64::from_be_bytes(first8) & 0x7fff_ffff_ffff_ffff) as i64
}
