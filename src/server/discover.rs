//! `DISCOVER` handler: aggregate one dimension into NDJSON value/count pairs.

use super::query::parse_number;
use super::ServerState;
use crate::db::Dimension;
use crate::error::{Error, Result};
use crate::proto::Request;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub async fn handle<W>(state: &ServerState, request: &Request, writer: &mut W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let raw = request
    .positional
    .first()
    .ok_or_else(|| Error::BadRequest("discover dimension required".into()))?;
  let dimension = Dimension::parse(raw)
    .ok_or_else(|| Error::BadRequest(format!("unknown dimension: {raw}")))?;
  let since_seconds = parse_number(&request.kv, "since")?;
  let limit = parse_number(&request.kv, "limit")?;

  let rows = state.store.discover(dimension, since_seconds, limit).await?;
  for row in rows {
    let line = serde_json::to_string(&row)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
  }
  Ok(())
}
