//! `INGEST_JOURNAL` handler: drive one incremental ingest and report counts.

use super::ServerState;
use crate::error::{Error, Result};
use crate::ingest;
use crate::proto::{self, Request};
use tokio::io::{AsyncWrite, AsyncWriteExt};

const DEFAULT_WINDOW_SECONDS: u64 = 3_600;

pub async fn handle<W>(state: &ServerState, request: &Request, writer: &mut W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let window_seconds = match request.positional.first() {
    None => DEFAULT_WINDOW_SECONDS,
    Some(raw) => parse_positive(raw, "seconds")?,
  };
  let max_records = request
    .positional
    .get(1)
    .map(|raw| parse_positive(raw, "limit"))
    .transpose()?;

  let outcome =
    ingest::ingest_journal(&state.store, &state.journal, window_seconds, max_records).await?;
  let line = proto::ok_with(&[
    ("inserted", outcome.inserted.to_string()),
    ("total", outcome.total.to_string()),
  ]);
  writer.write_all(line.as_bytes()).await?;
  Ok(())
}

fn parse_positive(raw: &str, what: &str) -> Result<u64> {
  raw
    .parse::<u64>()
    .ok()
    .filter(|n| *n >= 1)
    .ok_or_else(|| Error::BadRequest(format!("{what} must be a positive integer: {raw}")))
}
