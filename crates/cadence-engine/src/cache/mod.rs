//! Score-ordered cache index.
//!
//! One entry per (owner, partition). Each entry maps item ids to their next
//! review time and answers "the N earliest items due at or before now".
//! Entries are independent: writes to one key never wait on another, and a
//! batch write to one key is atomic to readers of that key.
//!
//! # Warm and cold entries
//!
//! A write can land on a key that has never been loaded from the durable
//! store. Such an entry is *cold*: it holds only the items written to it, so
//! [`CacheIndex::due_items`] reports it as a miss (`Ok(None)`) until the read
//! path rehydrates it with [`CacheIndex::hydrate`]. Hydration never overwrites
//! a score already present, since a cached score is at least as recent as the
//! durable one under write-behind persistence.

mod memory;

pub use memory::MemoryIndex;

use std::time::Duration;

use async_trait::async_trait;
use cadence_core::review::{
  Classification, ClassificationFilter, DueItem, ReviewRecord, ReviewResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ─── Keys and items ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
  pub owner_id:      String,
  pub partition_key: String,
}

impl CacheKey {
  pub fn new(owner_id: impl Into<String>, partition_key: impl Into<String>) -> Self {
    Self {
      owner_id:      owner_id.into(),
      partition_key: partition_key.into(),
    }
  }
}

/// One scored item as the cache sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
  pub item_id:        String,
  pub due_at:         DateTime<Utc>,
  pub classification: Classification,
}

impl From<&ReviewResponse> for CacheItem {
  fn from(r: &ReviewResponse) -> Self {
    Self {
      item_id:        r.item_id.clone(),
      due_at:         r.next_review_at,
      classification: r.classification.clone(),
    }
  }
}

impl From<&ReviewRecord> for CacheItem {
  fn from(r: &ReviewRecord) -> Self {
    Self {
      item_id:        r.item_id.clone(),
      due_at:         r.next_review_at,
      classification: r.classification.clone(),
    }
  }
}

/// Resident footprint of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
  pub keys:      usize,
  pub warm_keys: usize,
  pub items:     usize,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CacheError {
  /// Connectivity failure. Never to be read as "nothing due".
  #[error("cache unavailable: {0}")]
  Unavailable(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// A score-ordered index of due times, keyed by (owner, partition).
#[async_trait]
pub trait CacheIndex: Send + Sync {
  /// Liveness probe. Implementations must answer quickly; callers bound it
  /// with a timeout regardless.
  async fn available(&self) -> bool;

  /// Insert or overwrite one item. Last write wins.
  async fn upsert(&self, key: &CacheKey, item: CacheItem) -> CacheResult<()>;

  /// Insert or overwrite several items of one key atomically.
  async fn upsert_batch(&self, key: &CacheKey, items: &[CacheItem]) -> CacheResult<()>;

  /// Up to `limit` items due at or before `now`, earliest first, restricted to
  /// `filter`. `Ok(None)` means the key is missing or cold.
  async fn due_items(
    &self,
    key: &CacheKey,
    now: DateTime<Utc>,
    limit: usize,
    filter: &ClassificationFilter,
  ) -> CacheResult<Option<Vec<DueItem>>>;

  /// Returns whether the item was present.
  async fn remove(&self, key: &CacheKey, item_id: &str) -> CacheResult<bool>;

  /// The cached due time of one item, if any, whether or not the key is warm.
  async fn score(&self, key: &CacheKey, item_id: &str) -> CacheResult<Option<DateTime<Utc>>>;

  /// Merge durable `items` into `key` without overwriting cached scores, then
  /// mark the key warm. Returns the number of items added.
  async fn hydrate(&self, key: &CacheKey, items: Vec<CacheItem>) -> CacheResult<usize>;

  /// Replace the whole entry for `key` with `items` (warm), carrying over the
  /// cached scores of the items named in `preserve`. Returns the entry's new
  /// size.
  async fn replace(
    &self,
    key: &CacheKey,
    items: Vec<CacheItem>,
    preserve: &[String],
  ) -> CacheResult<usize>;

  /// Delete every key of `partition_key`, `batch_size` keys per scan step,
  /// yielding between steps. Returns the number of keys removed.
  async fn purge_partition(&self, partition_key: &str, batch_size: usize) -> CacheResult<u64>;

  /// Drop entries not read or written for `idle_for`. Returns how many went.
  async fn evict_idle(&self, idle_for: Duration) -> CacheResult<u64>;

  async fn stats(&self, partition_key: &str) -> CacheResult<PartitionStats>;
}
