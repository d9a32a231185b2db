//! Partition entities, one per logical epoch ("season").
//!
//! An entity is created by an administrator. The first time it is persisted
//! the engine provisions a physical storage partition for it and flips
//! `partition_created`; that flag never flips back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An epoch that review records are partitioned by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntity {
  pub partition_key:        String,
  pub is_active:            bool,
  /// Whether physical storage has been provisioned for this key.
  pub partition_created:    bool,
  pub caching_enabled:      bool,
  pub auto_archive_enabled: bool,
  pub created_at:           DateTime<Utc>,
}

impl PartitionEntity {
  /// Due for archival by the scheduled auto-archive job.
  pub fn awaiting_auto_archive(&self) -> bool {
    self.auto_archive_enabled && !self.is_active
  }
}

/// Input to [`crate::store::ReviewStore::create_partition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPartition {
  pub partition_key:        String,
  #[serde(default = "yes")]
  pub is_active:            bool,
  #[serde(default = "yes")]
  pub caching_enabled:      bool,
  #[serde(default)]
  pub auto_archive_enabled: bool,
}

fn yes() -> bool { true }

impl NewPartition {
  /// An active, cached partition with auto-archive off.
  pub fn new(partition_key: impl Into<String>) -> Self {
    Self {
      partition_key:        partition_key.into(),
      is_active:            true,
      caching_enabled:      true,
      auto_archive_enabled: false,
    }
  }
}

/// A partial update of a partition's flags; `None` leaves a flag unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionFlags {
  pub is_active:            Option<bool>,
  pub caching_enabled:      Option<bool>,
  pub auto_archive_enabled: Option<bool>,
}

impl PartitionFlags {
  /// Apply this patch to `entity`, returning the resulting entity.
  pub fn apply(&self, entity: &PartitionEntity) -> PartitionEntity {
    PartitionEntity {
      is_active: self.is_active.unwrap_or(entity.is_active),
      caching_enabled: self.caching_enabled.unwrap_or(entity.caching_enabled),
      auto_archive_enabled: self
        .auto_archive_enabled
        .unwrap_or(entity.auto_archive_enabled),
      ..entity.clone()
    }
  }
}

/// Result of asking the store to provision a physical partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provisioned {
  Created,
  /// Another caller (or an earlier run) got there first.
  AlreadyExisted,
}

// ─── Archival ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveRunState {
  Running,
  Completed,
  Failed,
}

/// One attempt to archive a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRun {
  pub run_id:            Uuid,
  pub partition_key:     String,
  pub state:             ArchiveRunState,
  pub archived_records:  u64,
  pub purged_cache_keys: u64,
  pub started_at:        DateTime<Utc>,
  pub finished_at:       Option<DateTime<Utc>>,
  pub error:             Option<String>,
}

impl ArchiveRun {
  pub fn start(partition_key: impl Into<String>) -> Self {
    Self {
      run_id:            Uuid::new_v4(),
      partition_key:     partition_key.into(),
      state:             ArchiveRunState::Running,
      archived_records:  0,
      purged_cache_keys: 0,
      started_at:        Utc::now(),
      finished_at:       None,
      error:             None,
    }
  }

  pub fn complete(mut self, archived_records: u64, purged_cache_keys: u64) -> Self {
    self.state = ArchiveRunState::Completed;
    self.archived_records = archived_records;
    self.purged_cache_keys = purged_cache_keys;
    self.finished_at = Some(Utc::now());
    self
  }

  pub fn fail(mut self, error: impl Into<String>) -> Self {
    self.state = ArchiveRunState::Failed;
    self.error = Some(error.into());
    self.finished_at = Some(Utc::now());
    self
  }
}

/// Row counts for one partition across the active and archive tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCounts {
  pub active_records:       u64,
  pub archived_records:     u64,
  pub flagged_for_deletion: u64,
}
