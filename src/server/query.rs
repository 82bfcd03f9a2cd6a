//! `QUERY_LOGS` handler: typed filters in, NDJSON rows out.

use super::ServerState;
use crate::db::{LogFilter, SortOrder};
use crate::error::{Error, Result};
use crate::models::log_entry::ApiLogRow;
use crate::models::severity;
use crate::proto::Request;
use std::collections::HashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const DEFAULT_SINCE_SECONDS: i64 = 3_600;

pub async fn handle<W>(state: &ServerState, request: &Request, writer: &mut W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let filter = parse_filter(&request.kv)?;
  let rows = state.store.query_logs(&filter).await?;
  for row in rows {
    let line = serde_json::to_string(&ApiLogRow::from(row))?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
  }
  Ok(())
}

fn parse_filter(kv: &HashMap<String, String>) -> Result<LogFilter> {
  let mut filter = LogFilter {
    since_seconds: Some(parse_number(kv, "since")?.unwrap_or(DEFAULT_SINCE_SECONDS)),
    source: kv.get("source").cloned(),
    unit: kv.get("unit").cloned(),
    hostname: kv.get("hostname").cloned(),
    contains: kv.get("contains").cloned(),
    limit: parse_number(kv, "limit")?,
    ..LogFilter::default()
  };
  if let Some(name) = kv.get("min_severity") {
    let rank = severity::rank(name)
      .ok_or_else(|| Error::BadRequest(format!("unknown severity: {name}")))?;
    filter.min_severity = Some(rank);
  }
  if let Some(order) = kv.get("order") {
    filter.order = match order.to_ascii_lowercase().as_str() {
      "asc" => SortOrder::Asc,
      "desc" => SortOrder::Desc,
      other => {
        return Err(Error::BadRequest(format!(
          "order must be asc or desc: {other}"
        )))
      }
    };
  }
  Ok(filter)
}

pub(super) fn parse_number(kv: &HashMap<String, String>, key: &str) -> Result<Option<i64>> {
  kv.get(key)
    .map(|raw| {
      raw
        .parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| Error::BadRequest(format!("{key} must be a non-negative integer: {raw}")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn kv(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn defaults_apply() {
    let filter = parse_filter(&kv(&[])).unwrap();
    assert_eq!(filter.since_seconds, Some(3600));
    assert_eq!(filter.limit, None);
    assert_eq!(filter.order, SortOrder::Desc);
    assert_eq!(filter.min_severity, None);
  }

  #[test]
  fn parses_all_filters() {
    let filter = parse_filter(&kv(&[
      ("since", "60"),
      ("min_severity", "err"),
      ("source", "journal"),
      ("unit", "sshd"),
      ("hostname", "host1"),
      ("contains", "failed"),
      ("limit", "10"),
      ("order", "asc"),
    ]))
    .unwrap();
    assert_eq!(filter.since_seconds, Some(60));
    assert_eq!(filter.min_severity, Some(3));
    assert_eq!(filter.unit.as_deref(), Some("sshd"));
    assert_eq!(filter.order, SortOrder::Asc);
  }

  #[test]
  fn rejects_bad_values() {
    assert!(parse_filter(&kv(&[("since", "tomorrow")])).is_err());
    assert!(parse_filter(&kv(&[("since", "-1")])).is_err());
    assert!(parse_filter(&kv(&[("min_severity", "loud")])).is_err());
    assert!(parse_filter(&kv(&[("order", "sideways")])).is_err());
  }
}
