//! Error type for `cadence-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] cadence_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("timestamp out of range: {0}ms")]
  Timestamp(i64),

  #[error("unknown archive run state: {0:?}")]
  ArchiveState(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
