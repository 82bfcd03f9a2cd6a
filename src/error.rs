//! Error types shared across the daemon.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by request handling, ingestion, and the store.
#[derive(Error, Debug)]
pub enum Error {
  /// Unparseable request line, missing argument, or out-of-range number.
  #[error("bad arguments: {0}")]
  BadRequest(String),

  /// Verb not present in the routing table.
  #[error("unknown command: {0}")]
  UnknownCommand(String),

  /// The journal tool is missing or failed before emitting anything.
  #[error("journal unavailable: {0}")]
  JournalUnavailable(String),

  /// Database I/O, constraint, or migration failure.
  #[error("storage: {0}")]
  Storage(#[from] sqlx::Error),

  /// Row serialization failure while streaming a response.
  #[error("serialization: {0}")]
  Json(#[from] serde_json::Error),

  /// Socket or subprocess I/O failure.
  #[error("i/o: {0}")]
  Io(#[from] std::io::Error),
}
