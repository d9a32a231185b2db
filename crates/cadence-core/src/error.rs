//! Error types for `cadence-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("stability score {0} is outside 0..=4")]
  ScoreOutOfRange(f64),

  #[error("partition key must not be empty")]
  EmptyPartitionKey,

  #[error("owner id must not be empty")]
  EmptyOwner,

  #[error("item id must not be empty")]
  EmptyItem,

  #[error("batch contains no responses")]
  EmptyBatch,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
