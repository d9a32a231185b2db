//! Error type for `cadence-engine`.
//!
//! Cache outages, exhausted persistence retries, reconciliation discrepancies
//! and partition-creation races never show up here: they are absorbed by
//! degraded mode, the failure ledger, auto-correction, and idempotent
//! provisioning respectively.

use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid submission: {0}")]
  Invalid(#[from] cadence_core::Error),

  /// A degraded read was throttled; the caller should retry after the given
  /// interval.
  #[error("rate limited; retry in {}s", retry_after.as_secs().max(1))]
  RateLimited { retry_after: Duration },

  /// Every fallback is exhausted (e.g. the durable store is unreachable too).
  #[error("review data unavailable: {0}")]
  Unavailable(String),

  #[error("operation requires explicit confirmation")]
  ConfirmationRequired,

  #[error("partition {0:?} is active; enabling auto-archive needs confirmation")]
  ActivePartition(String),

  #[error("partition not found: {0}")]
  PartitionNotFound(String),

  #[error("partition already exists: {0}")]
  PartitionExists(String),

  /// The partition's records are in cold storage; it takes no more reviews.
  #[error("partition {0:?} has been archived")]
  PartitionArchived(String),

  #[error("partition {0:?} is already being archived")]
  ArchiveInProgress(String),

  #[error("cache rebuild already running for partition {0:?}")]
  RebuildInProgress(String),

  #[error("cache error: {0}")]
  Cache(#[from] CacheError),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Box a backend error into [`Error::Store`].
pub(crate) fn store_err<E>(e: E) -> Error
where
  E: std::error::Error + Send + Sync + 'static,
{
  Error::Store(Box::new(e))
}

/// A durable-store failure on a path with no further fallback.
pub(crate) fn unavailable<E>(e: E) -> Error
where
  E: std::error::Error + Send + Sync + 'static,
{
  Error::Unavailable(e.to_string())
}
