//! Discovery aggregation rows.

use serde::Serialize;
use sqlx::FromRow;

/// One distinct value of a dimension paired with its row count.
#[derive(Debug, Serialize, FromRow)]
pub struct DiscoverRow {
  pub value: Option<String>,
  pub count: i64,
}
