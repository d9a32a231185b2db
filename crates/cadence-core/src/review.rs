//! Review records, one row per (owner, partition, item).
//!
//! A record is created on the first review of an item and overwritten on every
//! later review. It never changes partition; when its partition is archived
//! the row moves to the archive table and leaves the active one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Lower bound of [`ReviewRecord::stability_score`].
pub const MIN_STABILITY: f64 = 0.0;
/// Upper bound of [`ReviewRecord::stability_score`].
pub const MAX_STABILITY: f64 = 4.0;

// ─── Classification ──────────────────────────────────────────────────────────

/// Optional tags attached to a tracked item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
  pub subject: Option<String>,
  pub topic:   Option<String>,
}

impl Classification {
  pub fn is_empty(&self) -> bool {
    self.subject.is_none() && self.topic.is_none()
  }

  /// Fill any tag missing here from `previous`. A review submitted without
  /// tags keeps the tags the item already had.
  pub fn or(self, previous: &Classification) -> Classification {
    Classification {
      subject: self.subject.or_else(|| previous.subject.clone()),
      topic:   self.topic.or_else(|| previous.topic.clone()),
    }
  }
}

/// Restricts due-item reads to items carrying the given tags. A `None` field
/// matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationFilter {
  pub subject: Option<String>,
  pub topic:   Option<String>,
}

impl ClassificationFilter {
  pub fn is_unrestricted(&self) -> bool {
    self.subject.is_none() && self.topic.is_none()
  }

  pub fn matches(&self, tags: &Classification) -> bool {
    fn field(want: &Option<String>, have: &Option<String>) -> bool {
      match want {
        None => true,
        Some(w) => have.as_deref() == Some(w.as_str()),
      }
    }
    field(&self.subject, &tags.subject) && field(&self.topic, &tags.topic)
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// The durable schedule of one item for one owner within one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
  pub owner_id:         String,
  /// Immutable once set; also the physical partitioning key.
  pub partition_key:    String,
  pub item_id:          String,
  pub stability_score:  f64,
  pub next_review_at:   DateTime<Utc>,
  pub last_reviewed_at: DateTime<Utc>,
  #[serde(default)]
  pub classification:   Classification,
}

/// A review record moved to cold storage by the archiver.
///
/// Read-only except for `eligible_for_deletion`, which only the retention
/// job sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedRecord {
  #[serde(flatten)]
  pub record:                ReviewRecord,
  pub archived_at:           DateTime<Utc>,
  pub eligible_for_deletion: bool,
}

// ─── Submissions ─────────────────────────────────────────────────────────────

/// One scored response inside a submitted batch. The score and due time are
/// computed upstream; this engine only schedules, caches, and persists them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResponse {
  pub item_id:         String,
  pub stability_score: f64,
  pub next_review_at:  DateTime<Utc>,
  #[serde(default)]
  pub classification:  Classification,
}

impl ReviewResponse {
  pub fn new(
    item_id: impl Into<String>,
    stability_score: f64,
    next_review_at: DateTime<Utc>,
  ) -> Self {
    Self {
      item_id: item_id.into(),
      stability_score,
      next_review_at,
      classification: Classification::default(),
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.item_id.is_empty() {
      return Err(Error::EmptyItem);
    }
    if !self.stability_score.is_finite()
      || !(MIN_STABILITY..=MAX_STABILITY).contains(&self.stability_score)
    {
      return Err(Error::ScoreOutOfRange(self.stability_score));
    }
    Ok(())
  }
}

/// A batch of responses bound for the durable store as a single transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewBatch {
  /// Handed back to the submitter; also the durable idempotency key.
  pub job_ref:       Uuid,
  pub owner_id:      String,
  pub partition_key: String,
  /// Becomes `last_reviewed_at` on every row the batch touches.
  pub reviewed_at:   DateTime<Utc>,
  pub responses:     Vec<ReviewResponse>,
}

impl ReviewBatch {
  pub fn validate(&self) -> Result<()> {
    if self.owner_id.is_empty() {
      return Err(Error::EmptyOwner);
    }
    if self.partition_key.is_empty() {
      return Err(Error::EmptyPartitionKey);
    }
    if self.responses.is_empty() {
      return Err(Error::EmptyBatch);
    }
    self.responses.iter().try_for_each(ReviewResponse::validate)
  }

  /// The records this batch writes, in submission order.
  pub fn records(&self) -> impl Iterator<Item = ReviewRecord> + '_ {
    self.responses.iter().map(|r| ReviewRecord {
      owner_id:         self.owner_id.clone(),
      partition_key:    self.partition_key.clone(),
      item_id:          r.item_id.clone(),
      stability_score:  r.stability_score,
      next_review_at:   r.next_review_at,
      last_reviewed_at: self.reviewed_at,
      classification:   r.classification.clone(),
    })
  }
}

/// What happened when a batch reached the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PersistOutcome {
  Applied { rows: usize },
  /// The batch's `job_ref` was already in the audit trail.
  AlreadyApplied,
  /// The batch's partition has been archived; nothing was written.
  PartitionArchived,
}

/// A batch that could not be persisted within the retry ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistFailure {
  pub job_ref:       Uuid,
  pub owner_id:      String,
  pub partition_key: String,
  pub attempts:      u32,
  pub last_error:    String,
  pub responses:     Vec<ReviewResponse>,
  pub failed_at:     DateTime<Utc>,
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// An item whose next review time has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueItem {
  pub item_id:        String,
  pub next_review_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Classification::is_empty")]
  pub classification: Classification,
}

impl From<ReviewRecord> for DueItem {
  fn from(r: ReviewRecord) -> Self {
    Self {
      item_id:        r.item_id,
      next_review_at: r.next_review_at,
      classification: r.classification,
    }
  }
}

/// Parameters for an indexed due-item read against the durable store.
#[derive(Debug, Clone)]
pub struct DueQuery {
  pub owner_id:      String,
  pub partition_key: String,
  pub due_before:    DateTime<Utc>,
  pub limit:         usize,
  pub filter:        ClassificationFilter,
}
