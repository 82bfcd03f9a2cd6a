//! Incremental journal ingestion: read the cursor, stream records, dedup,
//! insert in batches, advance the cursor with each committed batch.

use crate::db::{CursorUpdate, Store};
use crate::error::Result;
use crate::journal::{JournalReader, JournalRecord};
use crate::models::log_entry::NewLogEntry;
use tracing::{info, warn};

/// Source name under which journal ingest state is tracked.
pub const SOURCE_NAME: &str = "journal";

/// Rows per insert transaction.
pub const BATCH_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOutcome {
  /// Rows actually added by this run.
  pub inserted: u64,
  /// Rows in the store after the run.
  pub total: i64,
}

/// Drive one end-to-end journal ingest. Each batch commits together with its
/// cursor advance; a failing batch rolls back both and leaves earlier batches
/// committed. Records without a cursor are inserted but never advance the
/// cursor.
pub async fn ingest_journal(
  store: &Store,
  reader: &JournalReader,
  window_seconds: u64,
  max_records: Option<u64>,
) -> Result<IngestOutcome> {
  let start_cursor = store.get_cursor(SOURCE_NAME).await?;
  let mut stream = reader
    .stream(window_seconds, max_records, start_cursor.as_deref())
    .await?;

  let mut batch: Vec<NewLogEntry> = Vec::with_capacity(BATCH_SIZE);
  let mut batch_cursor: Option<String> = None;
  let mut inserted = 0u64;

  while let Some(record) = stream.next_record().await? {
    if let Some(cursor) = &record.cursor {
      batch_cursor = Some(cursor.clone());
    }
    batch.push(normalize(record));
    if batch.len() >= BATCH_SIZE {
      inserted += flush(store, &batch, batch_cursor.take()).await?;
      batch.clear();
    }
  }
  if !batch.is_empty() {
    inserted += flush(store, &batch, batch_cursor.take()).await?;
  }

  if stream.malformed > 0 || stream.missing_ts > 0 {
    warn!(
      malformed = stream.malformed,
      missing_ts = stream.missing_ts,
      "skipped unusable journal lines"
    );
  }

  let total = store.count_logs().await?;
  info!(inserted, total, "journal ingest complete");
  Ok(IngestOutcome { inserted, total })
}

fn normalize(record: JournalRecord) -> NewLogEntry {
  NewLogEntry::new(
    record.ts,
    record.hostname,
    record.unit,
    SOURCE_NAME.to_string(),
    record.severity,
    record.message,
    record.cursor,
  )
}

async fn flush(store: &Store, batch: &[NewLogEntry], cursor: Option<String>) -> Result<u64> {
  let update = cursor.as_deref().map(|cursor| CursorUpdate {
    source_name: SOURCE_NAME,
    cursor,
  });
  store.insert_logs(batch, update).await
}
