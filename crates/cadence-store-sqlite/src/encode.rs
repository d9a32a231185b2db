//! Encoding and decoding helpers between domain types and the plain
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as integer unix milliseconds so range predicates on
//! `next_review_at` stay index-friendly. UUIDs are hyphenated lowercase
//! strings; response payloads are compact JSON.

use chrono::{DateTime, Utc};
use cadence_core::{
  partition::{ArchiveRun, ArchiveRunState, PartitionEntity},
  review::{ArchivedRecord, Classification, PersistFailure, ReviewRecord, ReviewResponse},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_ts(dt: DateTime<Utc>) -> i64 { dt.timestamp_millis() }

pub fn decode_ts(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or(Error::Timestamp(ms))
}

// ─── ArchiveRunState ─────────────────────────────────────────────────────────

pub fn encode_run_state(s: ArchiveRunState) -> &'static str {
  match s {
    ArchiveRunState::Running => "running",
    ArchiveRunState::Completed => "completed",
    ArchiveRunState::Failed => "failed",
  }
}

pub fn decode_run_state(s: &str) -> Result<ArchiveRunState> {
  match s {
    "running" => Ok(ArchiveRunState::Running),
    "completed" => Ok(ArchiveRunState::Completed),
    "failed" => Ok(ArchiveRunState::Failed),
    other => Err(Error::ArchiveState(other.to_owned())),
  }
}

// ─── Responses ───────────────────────────────────────────────────────────────

pub fn encode_responses(responses: &[ReviewResponse]) -> Result<String> {
  Ok(serde_json::to_string(responses)?)
}

pub fn decode_responses(s: &str) -> Result<Vec<ReviewResponse>> {
  Ok(serde_json::from_str(s)?)
}

// ─── Raw row types ───────────────────────────────────────────────────────────

/// Column list shared by every query that builds a [`RawRecord`].
pub const RECORD_COLUMNS: &str = "owner_id, partition_key, item_id, \
  stability_score, next_review_at, last_reviewed_at, subject, topic";

/// A `review_records` row as it comes off the wire.
pub struct RawRecord {
  pub owner_id:         String,
  pub partition_key:    String,
  pub item_id:          String,
  pub stability_score:  f64,
  pub next_review_at:   i64,
  pub last_reviewed_at: i64,
  pub subject:          Option<String>,
  pub topic:            Option<String>,
}

impl RawRecord {
  /// Map a row selected with [`RECORD_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      owner_id:         row.get(0)?,
      partition_key:    row.get(1)?,
      item_id:          row.get(2)?,
      stability_score:  row.get(3)?,
      next_review_at:   row.get(4)?,
      last_reviewed_at: row.get(5)?,
      subject:          row.get(6)?,
      topic:            row.get(7)?,
    })
  }

  pub fn into_record(self) -> Result<ReviewRecord> {
    Ok(ReviewRecord {
      owner_id:         self.owner_id,
      partition_key:    self.partition_key,
      item_id:          self.item_id,
      stability_score:  self.stability_score,
      next_review_at:   decode_ts(self.next_review_at)?,
      last_reviewed_at: decode_ts(self.last_reviewed_at)?,
      classification:   Classification {
        subject: self.subject,
        topic:   self.topic,
      },
    })
  }
}

/// [`RECORD_COLUMNS`] followed by the two archive-only columns.
pub const ARCHIVED_COLUMNS: &str = "owner_id, partition_key, item_id, \
  stability_score, next_review_at, last_reviewed_at, subject, topic, \
  archived_at, eligible_for_deletion";

/// An `archived_records` row.
pub struct RawArchived {
  pub record:                RawRecord,
  pub archived_at:           i64,
  pub eligible_for_deletion: bool,
}

impl RawArchived {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      record:                RawRecord::from_row(row)?,
      archived_at:           row.get(8)?,
      eligible_for_deletion: row.get(9)?,
    })
  }

  pub fn into_archived(self) -> Result<ArchivedRecord> {
    Ok(ArchivedRecord {
      record:                self.record.into_record()?,
      archived_at:           decode_ts(self.archived_at)?,
      eligible_for_deletion: self.eligible_for_deletion,
    })
  }
}

pub const PARTITION_COLUMNS: &str = "partition_key, is_active, \
  partition_created, caching_enabled, auto_archive_enabled, created_at";

pub struct RawPartition {
  pub partition_key:        String,
  pub is_active:            bool,
  pub partition_created:    bool,
  pub caching_enabled:      bool,
  pub auto_archive_enabled: bool,
  pub created_at:           i64,
}

impl RawPartition {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      partition_key:        row.get(0)?,
      is_active:            row.get(1)?,
      partition_created:    row.get(2)?,
      caching_enabled:      row.get(3)?,
      auto_archive_enabled: row.get(4)?,
      created_at:           row.get(5)?,
    })
  }

  pub fn into_entity(self) -> Result<PartitionEntity> {
    Ok(PartitionEntity {
      partition_key:        self.partition_key,
      is_active:            self.is_active,
      partition_created:    self.partition_created,
      caching_enabled:      self.caching_enabled,
      auto_archive_enabled: self.auto_archive_enabled,
      created_at:           decode_ts(self.created_at)?,
    })
  }
}

pub const RUN_COLUMNS: &str = "run_id, partition_key, state, archived_records, \
  purged_cache_keys, started_at, finished_at, error";

pub struct RawArchiveRun {
  pub run_id:            String,
  pub partition_key:     String,
  pub state:             String,
  pub archived_records:  i64,
  pub purged_cache_keys: i64,
  pub started_at:        i64,
  pub finished_at:       Option<i64>,
  pub error:             Option<String>,
}

impl RawArchiveRun {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      run_id:            row.get(0)?,
      partition_key:     row.get(1)?,
      state:             row.get(2)?,
      archived_records:  row.get(3)?,
      purged_cache_keys: row.get(4)?,
      started_at:        row.get(5)?,
      finished_at:       row.get(6)?,
      error:             row.get(7)?,
    })
  }

  pub fn into_run(self) -> Result<ArchiveRun> {
    Ok(ArchiveRun {
      run_id:            decode_uuid(&self.run_id)?,
      partition_key:     self.partition_key,
      state:             decode_run_state(&self.state)?,
      archived_records:  self.archived_records.max(0) as u64,
      purged_cache_keys: self.purged_cache_keys.max(0) as u64,
      started_at:        decode_ts(self.started_at)?,
      finished_at:       self.finished_at.map(decode_ts).transpose()?,
      error:             self.error,
    })
  }
}

pub struct RawFailure {
  pub job_ref:        String,
  pub owner_id:       String,
  pub partition_key:  String,
  pub attempts:       u32,
  pub last_error:     String,
  pub responses_json: String,
  pub failed_at:      i64,
}

impl RawFailure {
  pub fn into_failure(self) -> Result<PersistFailure> {
    Ok(PersistFailure {
      job_ref:       decode_uuid(&self.job_ref)?,
      owner_id:      self.owner_id,
      partition_key: self.partition_key,
      attempts:      self.attempts,
      last_error:    self.last_error,
      responses:     decode_responses(&self.responses_json)?,
      failed_at:     decode_ts(self.failed_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timestamps_keep_millisecond_precision() {
    let dt = DateTime::from_timestamp_millis(1_700_000_123_456).unwrap();
    assert_eq!(decode_ts(encode_ts(dt)).unwrap(), dt);
  }

  #[test]
  fn unknown_run_state_is_an_error() {
    assert!(matches!(
      decode_run_state("paused"),
      Err(Error::ArchiveState(s)) if s == "paused"
    ));
  }
}
