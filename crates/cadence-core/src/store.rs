//! The `ReviewStore` trait: the durable, partitioned source of truth.
//!
//! Implemented by storage backends (e.g. `cadence-store-sqlite`). The engine
//! depends on this abstraction, never on a concrete database.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
  partition::{
    ArchiveRun, NewPartition, PartitionCounts, PartitionEntity, PartitionFlags,
    Provisioned,
  },
  review::{
    ArchivedRecord, DueQuery, PersistFailure, PersistOutcome, ReviewBatch, ReviewRecord,
  },
};

/// Abstraction over the durable review store.
///
/// All methods return `Send` futures so the trait can be driven from
/// background workers on a multi-threaded runtime.
pub trait ReviewStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Review records ────────────────────────────────────────────────────

  /// Upsert every response in `batch` and append the audit trail, all in one
  /// transaction.
  ///
  /// Rows are keyed by (owner, partition, item). An existing row is only
  /// overwritten when the batch is not older than the row's
  /// `last_reviewed_at`, so applying batches out of order converges on the
  /// latest one. A batch whose `job_ref` is already audited is not applied
  /// again, and neither is a batch for a partition that has been archived.
  fn persist_batch(
    &self,
    batch: ReviewBatch,
  ) -> impl Future<Output = Result<PersistOutcome, Self::Error>> + Send + '_;

  /// Every active record of one owner within one partition.
  fn load_owner<'a>(
    &'a self,
    owner_id: &'a str,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<Vec<ReviewRecord>, Self::Error>> + Send + 'a;

  /// Indexed read of the most urgent records due before `query.due_before`,
  /// ascending by due time.
  fn top_due<'a>(
    &'a self,
    query: &'a DueQuery,
  ) -> impl Future<Output = Result<Vec<ReviewRecord>, Self::Error>> + Send + 'a;

  fn get_review<'a>(
    &'a self,
    owner_id: &'a str,
    partition_key: &'a str,
    item_id: &'a str,
  ) -> impl Future<Output = Result<Option<ReviewRecord>, Self::Error>> + Send + 'a;

  /// A uniformly random sample of at most `limit` records drawn from active
  /// partitions.
  fn sample_active(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<ReviewRecord>, Self::Error>> + Send + '_;

  /// Distinct owners holding active records in `partition_key`.
  fn owners_in_partition<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;

  // ── Persistence failures ──────────────────────────────────────────────

  fn record_persist_failure(
    &self,
    failure: PersistFailure,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Most recent failures first.
  fn list_persist_failures(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<PersistFailure>, Self::Error>> + Send + '_;

  // ── Physical partitions ───────────────────────────────────────────────

  fn storage_partition_exists<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Provision physical storage for `partition_key`. Losing a race against a
  /// concurrent provisioner yields [`Provisioned::AlreadyExisted`], not an
  /// error.
  fn provision_storage_partition<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<Provisioned, Self::Error>> + Send + 'a;

  fn list_storage_partitions(
    &self,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + '_;

  // ── Partition entities ────────────────────────────────────────────────

  /// Persist a new entity. Returns `None` if the key is already taken.
  fn create_partition(
    &self,
    input: NewPartition,
  ) -> impl Future<Output = Result<Option<PartitionEntity>, Self::Error>> + Send + '_;

  fn get_partition<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<Option<PartitionEntity>, Self::Error>> + Send + 'a;

  fn list_partitions(
    &self,
  ) -> impl Future<Output = Result<Vec<PartitionEntity>, Self::Error>> + Send + '_;

  /// Apply `flags`; returns the updated entity or `None` if it doesn't exist.
  fn update_partition<'a>(
    &'a self,
    partition_key: &'a str,
    flags: PartitionFlags,
  ) -> impl Future<Output = Result<Option<PartitionEntity>, Self::Error>> + Send + 'a;

  /// Set `partition_created`. Returns `true` only for the call that flipped
  /// it.
  fn mark_partition_created<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  // ── Archival ──────────────────────────────────────────────────────────

  /// Copy every active record of `partition_key` into the archive table,
  /// stamped with `archived_at`, delete them from the active table, and mark
  /// the partition archived. All three commit together or not at all.
  /// Returns the number of rows moved.
  fn archive_partition_records<'a>(
    &'a self,
    partition_key: &'a str,
    archived_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

  /// Whether `partition_key` has been archived. Once set this never clears.
  fn is_partition_archived<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Up to `limit` archived records of one partition, most recently archived
  /// first.
  fn archived_records<'a>(
    &'a self,
    partition_key: &'a str,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<ArchivedRecord>, Self::Error>> + Send + 'a;

  /// Insert or replace an archive run, keyed by `run_id`.
  fn record_archive_run(
    &self,
    run: ArchiveRun,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn last_archive_run<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<Option<ArchiveRun>, Self::Error>> + Send + 'a;

  fn partition_counts<'a>(
    &'a self,
    partition_key: &'a str,
  ) -> impl Future<Output = Result<PartitionCounts, Self::Error>> + Send + 'a;

  /// Flag archived records archived before `cutoff` as eligible for deletion.
  /// Returns the number of rows newly flagged.
  fn flag_expired_archives(
    &self,
    cutoff: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Physically delete every archived record flagged for deletion.
  fn purge_flagged_archives(
    &self,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;
}
