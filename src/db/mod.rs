//! Analytic store: schema, migrations, and typed query operations.
//!
//! Every operation opens a fresh SQLite connection and runs at most one
//! transaction, so handlers never share connection state and a failed request
//! cannot poison another. The database file is the only shared resource.

use crate::error::Result;
use crate::models::discovery::DiscoverRow;
use crate::models::log_entry::{LogRow, NewLogEntry};
use crate::models::severity;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use std::path::Path;

pub const DEFAULT_QUERY_LIMIT: i64 = 100;
pub const MAX_QUERY_LIMIT: i64 = 10_000;
pub const DEFAULT_DISCOVER_LIMIT: i64 = 50;
pub const MAX_DISCOVER_LIMIT: i64 = 500;
pub const DEFAULT_DISCOVER_SINCE: i64 = 86_400;

const LOGS_COLUMNS: &str = "\
id BIGINT PRIMARY KEY, \
ts TIMESTAMP, \
hostname TEXT, \
unit TEXT, \
source TEXT, \
severity TEXT, \
message TEXT, \
cursor TEXT UNIQUE, \
fingerprint TEXT";

const INSERT_LOG: &str = "INSERT OR IGNORE INTO logs \
  (id, ts, hostname, unit, source, severity, message, cursor, fingerprint) \
  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Cursor advance committed atomically with a batch insert.
#[derive(Debug, Clone, Copy)]
pub struct CursorUpdate<'a> {
  pub source_name: &'a str,
  pub cursor: &'a str,
}

/// Filters for `query_logs`; all optional, combined with AND.
#[derive(Debug, Default)]
pub struct LogFilter {
  pub since_seconds: Option<i64>,
  /// Severity rank threshold (0 = emerg); rows outside the known set never
  /// match.
  pub min_severity: Option<u8>,
  pub source: Option<String>,
  pub unit: Option<String>,
  pub hostname: Option<String>,
  pub contains: Option<String>,
  pub limit: Option<i64>,
  pub order: SortOrder,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
  Asc,
  #[default]
  Desc,
}

impl SortOrder {
  fn sql(self) -> &'static str {
    match self {
      SortOrder::Asc => "ASC",
      SortOrder::Desc => "DESC",
    }
  }
}

/// Aggregation dimensions for discovery queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
  Units,
  Hostnames,
  Sources,
  Severities,
}

impl Dimension {
  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "units" | "unit" => Some(Dimension::Units),
      "hostnames" | "hostname" => Some(Dimension::Hostnames),
      "sources" | "source" => Some(Dimension::Sources),
      "severities" | "severity" => Some(Dimension::Severities),
      _ => None,
    }
  }

  fn column(self) -> &'static str {
    match self {
      Dimension::Units => "unit",
      Dimension::Hostnames => "hostname",
      Dimension::Sources => "source",
      Dimension::Severities => "severity",
    }
  }
}

/// Handle on the analytic database. Cheap to clone; holds connection options,
/// never a live connection.
#[derive(Clone)]
pub struct Store {
  options: SqliteConnectOptions,
}

impl Store {
  /// Open the store, creating the parent directory and migrating the schema.
  /// Schema or migration failure here is fatal: the caller must not listen.
  pub async fn open(path: &Path) -> Result<Self> {
    ensure_parent_dir(path)?;
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(std::time::Duration::from_secs(5));
    let store = Self { options };
    let mut conn = store.conn().await?;
    migrate(&mut conn).await?;
    Ok(store)
  }

  async fn conn(&self) -> Result<SqliteConnection> {
    Ok(self.options.connect().await?)
  }

  /// Insert a batch, ignoring rows whose `id` or `cursor` already exists.
  /// When `cursor_update` is set, the `ingest_state` upsert commits in the
  /// same transaction: on any error neither write is visible.
  pub async fn insert_logs(
    &self,
    batch: &[NewLogEntry],
    cursor_update: Option<CursorUpdate<'_>>,
  ) -> Result<u64> {
    let mut conn = self.conn().await?;
    let mut tx = conn.begin().await?;
    let mut inserted = 0u64;
    for entry in batch {
      let res = sqlx::query(INSERT_LOG)
        .bind(entry.id)
        .bind(entry.ts)
        .bind(&entry.hostname)
        .bind(&entry.unit)
        .bind(&entry.source)
        .bind(&entry.severity)
        .bind(&entry.message)
        .bind(entry.cursor.as_deref())
        .bind(&entry.fingerprint)
        .execute(&mut *tx)
        .await?;
      inserted += res.rows_affected();
    }
    if let Some(update) = cursor_update {
      upsert_cursor(&mut *tx, update.source_name, update.cursor).await?;
    }
    tx.commit().await?;
    Ok(inserted)
  }

  pub async fn get_cursor(&self, source_name: &str) -> Result<Option<String>> {
    let mut conn = self.conn().await?;
    let cursor: Option<Option<String>> =
      sqlx::query_scalar("SELECT cursor FROM ingest_state WHERE source_name = ?")
        .bind(source_name)
        .fetch_optional(&mut conn)
        .await?;
    Ok(cursor.flatten())
  }

  pub async fn set_cursor(&self, source_name: &str, cursor: &str) -> Result<()> {
    let mut conn = self.conn().await?;
    upsert_cursor(&mut conn, source_name, cursor).await
  }

  pub async fn count_logs(&self) -> Result<i64> {
    let mut conn = self.conn().await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs")
      .fetch_one(&mut conn)
      .await?;
    Ok(count)
  }

  /// Filtered, ordered page of log rows.
  pub async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogRow>> {
    let mut clauses: Vec<String> = Vec::new();
    if filter.since_seconds.is_some() {
      clauses.push("ts >= ?".into());
    }
    if filter.min_severity.is_some() {
      clauses.push(format!("({}) <= ?", severity::rank_case_sql()));
    }
    if filter.source.is_some() {
      clauses.push("source = ?".into());
    }
    if filter.unit.is_some() {
      clauses.push("unit = ?".into());
    }
    if filter.hostname.is_some() {
      clauses.push("hostname = ?".into());
    }
    if filter.contains.is_some() {
      clauses.push("message LIKE ?".into());
    }

    let where_sql = if clauses.is_empty() {
      String::new()
    } else {
      format!(" WHERE {}", clauses.join(" AND "))
    };
    let limit = filter
      .limit
      .unwrap_or(DEFAULT_QUERY_LIMIT)
      .clamp(1, MAX_QUERY_LIMIT);
    let sql = format!(
      "SELECT id, ts, hostname, unit, source, severity, message \
       FROM logs{where_sql} ORDER BY ts {} LIMIT ?",
      filter.order.sql()
    );

    let mut query = sqlx::query_as::<_, LogRow>(&sql);
    if let Some(seconds) = filter.since_seconds {
      query = query.bind(since_ts(seconds));
    }
    if let Some(rank) = filter.min_severity {
      query = query.bind(rank as i64);
    }
    if let Some(source) = &filter.source {
      query = query.bind(source);
    }
    if let Some(unit) = &filter.unit {
      query = query.bind(unit);
    }
    if let Some(hostname) = &filter.hostname {
      query = query.bind(hostname);
    }
    if let Some(substring) = &filter.contains {
      query = query.bind(format!("%{substring}%"));
    }

    let mut conn = self.conn().await?;
    Ok(query.bind(limit).fetch_all(&mut conn).await?)
  }

  /// Distinct values of one dimension with their counts, most frequent first.
  pub async fn discover(
    &self,
    dimension: Dimension,
    since_seconds: Option<i64>,
    limit: Option<i64>,
  ) -> Result<Vec<DiscoverRow>> {
    let column = dimension.column();
    let limit = limit
      .unwrap_or(DEFAULT_DISCOVER_LIMIT)
      .clamp(1, MAX_DISCOVER_LIMIT);
    let sql = format!(
      "SELECT {column} AS value, COUNT(*) AS count FROM logs \
       WHERE ts >= ? GROUP BY {column} ORDER BY count DESC, value ASC LIMIT ?"
    );
    let mut conn = self.conn().await?;
    let rows = sqlx::query_as::<_, DiscoverRow>(&sql)
      .bind(since_ts(since_seconds.unwrap_or(DEFAULT_DISCOVER_SINCE)))
      .bind(limit)
      .fetch_all(&mut conn)
      .await?;
    Ok(rows)
  }
}

fn since_ts(seconds: i64) -> DateTime<Utc> {
  Utc::now() - Duration::seconds(seconds)
}

async fn upsert_cursor(
  conn: &mut SqliteConnection,
  source_name: &str,
  cursor: &str,
) -> Result<()> {
  sqlx::query(
    "INSERT INTO ingest_state (source_name, cursor, updated_at) VALUES (?, ?, ?) \
     ON CONFLICT(source_name) DO UPDATE SET cursor = excluded.cursor, \
     updated_at = excluded.updated_at",
  )
  .bind(source_name)
  .bind(cursor)
  .bind(Utc::now())
  .execute(conn)
  .await?;
  Ok(())
}

async fn migrate(conn: &mut SqliteConnection) -> Result<()> {
  sqlx::query(&format!("CREATE TABLE IF NOT EXISTS logs ({LOGS_COLUMNS})"))
    .execute(&mut *conn)
    .await?;
  sqlx::query(
    "CREATE TABLE IF NOT EXISTS ingest_state (\
     source_name TEXT PRIMARY KEY, cursor TEXT, updated_at TIMESTAMP)",
  )
  .execute(&mut *conn)
  .await?;

  rebuild_legacy_ids(conn).await?;

  for index in [
    "CREATE INDEX IF NOT EXISTS idx_logs_ts ON logs(ts)",
    "CREATE INDEX IF NOT EXISTS idx_logs_unit ON logs(unit)",
    "CREATE INDEX IF NOT EXISTS idx_logs_hostname ON logs(hostname)",
    "CREATE INDEX IF NOT EXISTS idx_logs_severity ON logs(severity)",
  ] {
    sqlx::query(index).execute(&mut *conn).await?;
  }
  Ok(())
}

/// Older deployments used an AUTOINCREMENT row id. Rebuild such a table with
/// ids derived from the fingerprint. Single pass: everything runs in one
/// transaction and the old table survives until the final rename, so a crash
/// simply re-triggers the rebuild on the next start. Rows are copied ordered
/// by `ts` ascending, so on fingerprint collision the earliest row wins.
async fn rebuild_legacy_ids(conn: &mut SqliteConnection) -> Result<()> {
  let ddl: Option<String> =
    sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'logs'")
      .fetch_optional(&mut *conn)
      .await?;
  let Some(ddl) = ddl else { return Ok(()) };
  if !ddl.to_ascii_uppercase().contains("AUTOINCREMENT") {
    return Ok(());
  }

  tracing::info!("rebuilding logs table with deterministic ids");
  let mut tx = conn.begin().await?;
  sqlx::query("DROP TABLE IF EXISTS logs_rebuild")
    .execute(&mut *tx)
    .await?;
  sqlx::query(&format!("CREATE TABLE logs_rebuild ({LOGS_COLUMNS})"))
    .execute(&mut *tx)
    .await?;

  let rows = sqlx::query(
    "SELECT ts, hostname, unit, source, severity, message, cursor \
     FROM logs ORDER BY ts ASC",
  )
  .fetch_all(&mut *tx)
  .await?;
  let total = rows.len() as u64;
  let mut kept = 0u64;
  for row in rows {
    let entry = NewLogEntry::new(
      row.try_get("ts")?,
      row
        .try_get::<Option<String>, _>("hostname")?
        .unwrap_or_default(),
      row.try_get::<Option<String>, _>("unit")?.unwrap_or_default(),
      row
        .try_get::<Option<String>, _>("source")?
        .unwrap_or_default(),
      row
        .try_get::<Option<String>, _>("severity")?
        .unwrap_or_default(),
      row
        .try_get::<Option<String>, _>("message")?
        .unwrap_or_default(),
      row.try_get("cursor")?,
    );
    let res = sqlx::query(
      "INSERT OR IGNORE INTO logs_rebuild \
       (id, ts, hostname, unit, source, severity, message, cursor, fingerprint) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id)
    .bind(entry.ts)
    .bind(&entry.hostname)
    .bind(&entry.unit)
    .bind(&entry.source)
    .bind(&entry.severity)
    .bind(&entry.message)
    .bind(entry.cursor.as_deref())
    .bind(&entry.fingerprint)
    .execute(&mut *tx)
    .await?;
    kept += res.rows_affected();
  }

  sqlx::query("DROP TABLE logs").execute(&mut *tx).await?;
  sqlx::query("ALTER TABLE logs_rebuild RENAME TO logs")
    .execute(&mut *tx)
    .await?;
  tx.commit().await?;

  if kept < total {
    // Operators should review collisions rather than lose them silently.
    tracing::warn!(
      dropped = total - kept,
      "dropped rows with colliding fingerprints during id rebuild"
    );
  }
  tracing::info!(rows = kept, "logs table rebuild complete");
  Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() && !parent.exists() {
      std::fs::create_dir_all(parent)?;
      let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use tempfile::TempDir;

  fn entry(ts: DateTime<Utc>, severity: &str, message: &str, cursor: Option<&str>) -> NewLogEntry {
    NewLogEntry::new(
      ts,
      "host1".into(),
      "sshd".into(),
      "journal".into(),
      severity.into(),
      message.into(),
      cursor.map(str::to_string),
    )
  }

  async fn open_store(tmp: &TempDir) -> Store {
    Store::open(&tmp.path().join("test.db")).await.unwrap()
  }

  #[tokio::test]
  async fn insert_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    let batch = vec![
      entry(now, "info", "one", Some("c1")),
      entry(now + Duration::seconds(1), "info", "two", Some("c2")),
    ];
    assert_eq!(store.insert_logs(&batch, None).await.unwrap(), 2);
    assert_eq!(store.insert_logs(&batch, None).await.unwrap(), 0);
    assert_eq!(store.count_logs().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn duplicate_cursor_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    let first = vec![entry(now, "info", "one", Some("c1"))];
    // Different fields (fresh id) but a cursor already present.
    let second = vec![entry(now + Duration::seconds(1), "info", "two", Some("c1"))];
    assert_eq!(store.insert_logs(&first, None).await.unwrap(), 1);
    assert_eq!(store.insert_logs(&second, None).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn cursor_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    assert_eq!(store.get_cursor("journal").await.unwrap(), None);
    store.set_cursor("journal", "c10").await.unwrap();
    assert_eq!(
      store.get_cursor("journal").await.unwrap(),
      Some("c10".to_string())
    );
    store.set_cursor("journal", "c11").await.unwrap();
    assert_eq!(
      store.get_cursor("journal").await.unwrap(),
      Some("c11".to_string())
    );
  }

  #[tokio::test]
  async fn batch_insert_advances_cursor_atomically() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let batch = vec![entry(Utc::now(), "info", "one", Some("c1"))];
    let update = CursorUpdate {
      source_name: "journal",
      cursor: "c1",
    };
    store.insert_logs(&batch, Some(update)).await.unwrap();
    assert_eq!(
      store.get_cursor("journal").await.unwrap(),
      Some("c1".to_string())
    );
  }

  #[tokio::test]
  async fn min_severity_filters_by_rank() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    let batch = vec![
      entry(now - Duration::seconds(4), "crit", "c", None),
      entry(now - Duration::seconds(3), "err", "e", None),
      entry(now - Duration::seconds(2), "info", "i", None),
      entry(now - Duration::seconds(1), "debug", "d", None),
      // Unknown severity: ranked 99, excluded by any threshold.
      entry(now, "sideband", "s", None),
    ];
    store.insert_logs(&batch, None).await.unwrap();

    let filter = LogFilter {
      since_seconds: Some(3600),
      min_severity: Some(3),
      order: SortOrder::Asc,
      ..LogFilter::default()
    };
    let rows = store.query_logs(&filter).await.unwrap();
    let severities: Vec<_> = rows.iter().map(|r| r.severity.as_str()).collect();
    assert_eq!(severities, vec!["crit", "err"]);
  }

  #[tokio::test]
  async fn contains_matches_case_insensitively() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let batch = vec![
      entry(Utc::now(), "err", "Failed password for root", None),
      entry(Utc::now(), "info", "session opened", None),
    ];
    store.insert_logs(&batch, None).await.unwrap();

    for needle in ["failed password", "Failed Password"] {
      let filter = LogFilter {
        since_seconds: Some(3600),
        contains: Some(needle.into()),
        ..LogFilter::default()
      };
      let rows = store.query_logs(&filter).await.unwrap();
      assert_eq!(rows.len(), 1, "needle {needle:?}");
      assert_eq!(rows[0].message, "Failed password for root");
    }
  }

  #[tokio::test]
  async fn order_and_limit_apply() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    let batch: Vec<_> = (0..5)
      .map(|i| entry(now - Duration::seconds(i), "info", &format!("m{i}"), None))
      .collect();
    store.insert_logs(&batch, None).await.unwrap();

    let desc = store
      .query_logs(&LogFilter {
        since_seconds: Some(3600),
        limit: Some(3),
        ..LogFilter::default()
      })
      .await
      .unwrap();
    assert_eq!(desc.len(), 3);
    assert!(desc.windows(2).all(|w| w[0].ts >= w[1].ts));

    let asc = store
      .query_logs(&LogFilter {
        since_seconds: Some(3600),
        order: SortOrder::Asc,
        ..LogFilter::default()
      })
      .await
      .unwrap();
    assert_eq!(asc.len(), 5);
    assert!(asc.windows(2).all(|w| w[0].ts <= w[1].ts));
  }

  #[tokio::test]
  async fn exact_match_filters_combine() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    let mut other = entry(now, "info", "x", None);
    other.unit = "nginx".into();
    store
      .insert_logs(&[entry(now, "info", "y", None), other], None)
      .await
      .unwrap();

    let rows = store
      .query_logs(&LogFilter {
        unit: Some("sshd".into()),
        hostname: Some("host1".into()),
        source: Some("journal".into()),
        ..LogFilter::default()
      })
      .await
      .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].unit, "sshd");
  }

  #[tokio::test]
  async fn discover_counts_by_dimension() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let now = Utc::now();
    let mut batch = Vec::new();
    for i in 0..3 {
      batch.push(entry(
        now - Duration::seconds(i),
        "info",
        &format!("s{i}"),
        None,
      ));
    }
    let mut nginx = entry(now, "info", "n0", None);
    nginx.unit = "nginx".into();
    batch.push(nginx);
    store.insert_logs(&batch, None).await.unwrap();

    let rows = store
      .discover(Dimension::Units, Some(3600), None)
      .await
      .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].value.as_deref(), Some("sshd"));
    assert_eq!(rows[0].count, 3);
    assert_eq!(rows[1].value.as_deref(), Some("nginx"));
    assert_eq!(rows[1].count, 1);
  }

  #[tokio::test]
  async fn legacy_autoincrement_table_is_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("legacy.db");

    // Seed a database the way an old deployment would have left it.
    {
      let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
      sqlx::query(
        "CREATE TABLE logs (\
         id INTEGER PRIMARY KEY AUTOINCREMENT, ts TIMESTAMP, hostname TEXT, \
         unit TEXT, source TEXT, severity TEXT, message TEXT, \
         cursor TEXT UNIQUE, fingerprint TEXT)",
      )
      .execute(&mut conn)
      .await
      .unwrap();
      let early = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
      let late = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
      for (ts, message, cursor) in [
        (early, "keep me", "c1"),
        (late, "other", "c2"),
        // Same fields as the first row: same fingerprint after rebuild.
        (early, "keep me", "c3"),
      ] {
        sqlx::query(
          "INSERT INTO logs (ts, hostname, unit, source, severity, message, cursor) \
           VALUES (?, 'host1', 'sshd', 'journal', 'info', ?, ?)",
        )
        .bind(ts)
        .bind(message)
        .bind(cursor)
        .execute(&mut conn)
        .await
        .unwrap();
      }
    }

    let store = Store::open(&path).await.unwrap();
    assert_eq!(store.count_logs().await.unwrap(), 2);

    let rows = store
      .query_logs(&LogFilter {
        order: SortOrder::Asc,
        ..LogFilter::default()
      })
      .await
      .unwrap();
    let expected = entry(
      Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
      "info",
      "keep me",
      None,
    );
    assert_eq!(rows[0].id, expected.id);

    // Reopening finds the rebuilt schema and leaves it alone.
    let store = Store::open(&path).await.unwrap();
    assert_eq!(store.count_logs().await.unwrap(), 2);
  }
}
