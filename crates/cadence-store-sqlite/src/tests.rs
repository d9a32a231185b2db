//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{Duration, Utc};
use cadence_core::{
  partition::{ArchiveRun, ArchiveRunState, NewPartition, PartitionFlags, Provisioned},
  review::{
    Classification, ClassificationFilter, DueQuery, PersistFailure, PersistOutcome,
    ReviewBatch, ReviewResponse,
  },
  store::ReviewStore,
};
use uuid::Uuid;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn batch(owner: &str, partition: &str, responses: Vec<ReviewResponse>) -> ReviewBatch {
  ReviewBatch {
    job_ref:       Uuid::new_v4(),
    owner_id:      owner.into(),
    partition_key: partition.into(),
    reviewed_at:   Utc::now(),
    responses,
  }
}

fn due_query(owner: &str, partition: &str, limit: usize) -> DueQuery {
  DueQuery {
    owner_id:      owner.into(),
    partition_key: partition.into(),
    due_before:    Utc::now(),
    limit,
    filter:        ClassificationFilter::default(),
  }
}

// ─── Review records ──────────────────────────────────────────────────────────

#[tokio::test]
async fn persist_inserts_then_updates() {
  let s   = store().await;
  let now = Utc::now();

  let first = batch("u1", "s1", vec![ReviewResponse::new("a", 1.0, now)]);
  assert_eq!(
    s.persist_batch(first).await.unwrap(),
    PersistOutcome::Applied { rows: 1 }
  );

  let later = now + Duration::days(2);
  let second = batch("u1", "s1", vec![ReviewResponse::new("a", 2.5, later)]);
  s.persist_batch(second).await.unwrap();

  let rec = s.get_review("u1", "s1", "a").await.unwrap().unwrap();
  assert_eq!(rec.stability_score, 2.5);
  assert_eq!(rec.next_review_at.timestamp_millis(), later.timestamp_millis());
  assert_eq!(s.load_owner("u1", "s1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn replayed_job_ref_is_not_applied_twice() {
  let s = store().await;
  let b = batch("u1", "s1", vec![ReviewResponse::new("a", 1.0, Utc::now())]);

  s.persist_batch(b.clone()).await.unwrap();
  assert_eq!(
    s.persist_batch(b).await.unwrap(),
    PersistOutcome::AlreadyApplied
  );
}

#[tokio::test]
async fn older_batch_does_not_overwrite_newer_row() {
  let s   = store().await;
  let now = Utc::now();

  let mut newer = batch("u1", "s1", vec![ReviewResponse::new("a", 3.0, now + Duration::days(5))]);
  newer.reviewed_at = now;
  let mut older = batch("u1", "s1", vec![ReviewResponse::new("a", 1.0, now)]);
  older.reviewed_at = now - Duration::minutes(1);

  s.persist_batch(newer).await.unwrap();
  assert_eq!(
    s.persist_batch(older).await.unwrap(),
    PersistOutcome::Applied { rows: 0 }
  );

  let rec = s.get_review("u1", "s1", "a").await.unwrap().unwrap();
  assert_eq!(rec.stability_score, 3.0);
}

#[tokio::test]
async fn untagged_update_keeps_existing_tags() {
  let s   = store().await;
  let now = Utc::now();

  let mut tagged = ReviewResponse::new("a", 1.0, now);
  tagged.classification = Classification {
    subject: Some("math".into()),
    topic:   Some("fractions".into()),
  };
  s.persist_batch(batch("u1", "s1", vec![tagged])).await.unwrap();
  s.persist_batch(batch("u1", "s1", vec![ReviewResponse::new("a", 2.0, now)]))
    .await
    .unwrap();

  let rec = s.get_review("u1", "s1", "a").await.unwrap().unwrap();
  assert_eq!(rec.classification.subject.as_deref(), Some("math"));
}

#[tokio::test]
async fn empty_batch_is_rejected() {
  let s = store().await;
  assert!(s.persist_batch(batch("u1", "s1", vec![])).await.is_err());
}

#[tokio::test]
async fn top_due_is_bounded_ordered_and_filtered() {
  let s   = store().await;
  let now = Utc::now();

  let mut responses: Vec<ReviewResponse> = (0..20)
    .map(|i| ReviewResponse::new(format!("item-{i:02}"), 1.0, now - Duration::minutes(i)))
    .collect();
  responses.push(ReviewResponse::new("future", 1.0, now + Duration::hours(1)));
  let mut bio = ReviewResponse::new("bio", 1.0, now - Duration::days(1));
  bio.classification.subject = Some("bio".into());
  responses.push(bio);
  s.persist_batch(batch("u1", "s1", responses)).await.unwrap();

  let top = s.top_due(&due_query("u1", "s1", 10)).await.unwrap();
  assert_eq!(top.len(), 10);
  assert_eq!(top[0].item_id, "bio");
  assert!(top.windows(2).all(|w| w[0].next_review_at <= w[1].next_review_at));
  assert!(top.iter().all(|r| r.item_id != "future"));

  let mut filtered = due_query("u1", "s1", 10);
  filtered.filter.subject = Some("bio".into());
  let only_bio = s.top_due(&filtered).await.unwrap();
  assert_eq!(only_bio.len(), 1);
  assert_eq!(only_bio[0].item_id, "bio");
}

#[tokio::test]
async fn sample_skips_inactive_partitions() {
  let s   = store().await;
  let now = Utc::now();

  s.create_partition(NewPartition::new("live")).await.unwrap();
  let mut retired = NewPartition::new("retired");
  retired.is_active = false;
  s.create_partition(retired).await.unwrap();

  s.persist_batch(batch("u1", "live", vec![ReviewResponse::new("a", 1.0, now)]))
    .await
    .unwrap();
  s.persist_batch(batch("u1", "retired", vec![ReviewResponse::new("b", 1.0, now)]))
    .await
    .unwrap();

  let sample = s.sample_active(100).await.unwrap();
  assert_eq!(sample.len(), 1);
  assert_eq!(sample[0].partition_key, "live");
}

// ─── Partitions ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn provisioning_is_idempotent() {
  let s = store().await;

  assert!(!s.storage_partition_exists("s1").await.unwrap());
  assert_eq!(
    s.provision_storage_partition("s1").await.unwrap(),
    Provisioned::Created
  );
  assert_eq!(
    s.provision_storage_partition("s1").await.unwrap(),
    Provisioned::AlreadyExisted
  );
  assert!(s.storage_partition_exists("s1").await.unwrap());
  assert_eq!(s.list_storage_partitions().await.unwrap(), vec!["s1".to_string()]);
}

#[tokio::test]
async fn concurrent_provisioning_creates_one_partition() {
  let s = store().await;

  let handles: Vec<_> = (0..8)
    .map(|_| {
      let s = s.clone();
      tokio::spawn(async move { s.provision_storage_partition("s1").await })
    })
    .collect();

  let mut created = 0;
  for h in handles {
    if h.await.unwrap().unwrap() == Provisioned::Created {
      created += 1;
    }
  }
  assert_eq!(created, 1);
  assert_eq!(s.list_storage_partitions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn partition_created_flips_once() {
  let s = store().await;
  s.create_partition(NewPartition::new("s1")).await.unwrap();

  assert!(s.mark_partition_created("s1").await.unwrap());
  assert!(!s.mark_partition_created("s1").await.unwrap());
  assert!(s.get_partition("s1").await.unwrap().unwrap().partition_created);
}

#[tokio::test]
async fn duplicate_partition_entity_returns_none() {
  let s = store().await;
  assert!(s.create_partition(NewPartition::new("s1")).await.unwrap().is_some());
  assert!(s.create_partition(NewPartition::new("s1")).await.unwrap().is_none());
}

#[tokio::test]
async fn update_partition_applies_only_given_flags() {
  let s = store().await;
  s.create_partition(NewPartition::new("s1")).await.unwrap();

  let updated = s
    .update_partition("s1", PartitionFlags {
      is_active: Some(false),
      ..Default::default()
    })
    .await
    .unwrap()
    .unwrap();
  assert!(!updated.is_active);
  assert!(updated.caching_enabled);

  assert!(s
    .update_partition("missing", PartitionFlags::default())
    .await
    .unwrap()
    .is_none());
}

// ─── Archival ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn archive_moves_only_the_target_partition() {
  let s   = store().await;
  let now = Utc::now();

  s.persist_batch(batch("u1", "old", vec![
    ReviewResponse::new("a", 1.0, now),
    ReviewResponse::new("b", 1.0, now),
  ]))
  .await
  .unwrap();
  s.persist_batch(batch("u1", "new", vec![ReviewResponse::new("c", 1.0, now)]))
    .await
    .unwrap();

  assert_eq!(s.archive_partition_records("old", now).await.unwrap(), 2);

  let old = s.partition_counts("old").await.unwrap();
  assert_eq!(old.active_records, 0);
  assert_eq!(old.archived_records, 2);
  assert_eq!(s.partition_counts("new").await.unwrap().active_records, 1);
}

#[tokio::test]
async fn failed_archive_rolls_back_copy() {
  let s   = store().await;
  let now = Utc::now();

  s.persist_batch(batch("u1", "old", vec![ReviewResponse::new("a", 1.0, now)]))
    .await
    .unwrap();

  // Simulate a crash between the copy and the delete.
  s.execute_batch(
    "CREATE TRIGGER crash_before_delete BEFORE DELETE ON review_records
     BEGIN SELECT RAISE(ABORT, 'simulated crash'); END;",
  )
  .await
  .unwrap();

  assert!(s.archive_partition_records("old", now).await.is_err());

  let counts = s.partition_counts("old").await.unwrap();
  assert_eq!(counts.active_records, 1);
  assert_eq!(counts.archived_records, 0);
  assert!(!s.is_partition_archived("old").await.unwrap());
}

#[tokio::test]
async fn archived_partition_takes_no_more_writes() {
  let s   = store().await;
  let now = Utc::now();

  s.persist_batch(batch("u1", "old", vec![ReviewResponse::new("a", 1.0, now)]))
    .await
    .unwrap();
  s.archive_partition_records("old", now).await.unwrap();
  assert!(s.is_partition_archived("old").await.unwrap());
  assert!(!s.is_partition_archived("new").await.unwrap());

  // A job queued before the archival lands after it.
  let late = batch("u1", "old", vec![ReviewResponse::new("b", 2.0, now)]);
  assert_eq!(
    s.persist_batch(late).await.unwrap(),
    PersistOutcome::PartitionArchived
  );
  assert_eq!(s.partition_counts("old").await.unwrap().active_records, 0);
  assert!(s.get_review("u1", "old", "b").await.unwrap().is_none());
}

#[tokio::test]
async fn archived_records_are_readable() {
  let s   = store().await;
  let now = Utc::now();

  s.persist_batch(batch("u1", "old", vec![
    ReviewResponse::new("a", 1.0, now),
    ReviewResponse::new("b", 3.0, now),
  ]))
  .await
  .unwrap();
  s.archive_partition_records("old", now).await.unwrap();

  let archived = s.archived_records("old", 10).await.unwrap();
  assert_eq!(archived.len(), 2);
  assert!(archived.iter().all(|r| r.record.partition_key == "old"));
  assert!(archived.iter().all(|r| !r.eligible_for_deletion));
  assert_eq!(archived[0].archived_at.timestamp_millis(), now.timestamp_millis());

  assert_eq!(s.archived_records("old", 1).await.unwrap().len(), 1);
  assert!(s.archived_records("new", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn retention_flagging_and_purge() {
  let s   = store().await;
  let now = Utc::now();

  s.persist_batch(batch("u1", "old", vec![ReviewResponse::new("a", 1.0, now)]))
    .await
    .unwrap();
  s.archive_partition_records("old", now - Duration::days(1200))
    .await
    .unwrap();

  assert_eq!(
    s.flag_expired_archives(now - Duration::days(1095)).await.unwrap(),
    1
  );
  // Already flagged rows are not counted again.
  assert_eq!(
    s.flag_expired_archives(now - Duration::days(1095)).await.unwrap(),
    0
  );
  assert_eq!(s.partition_counts("old").await.unwrap().flagged_for_deletion, 1);

  assert_eq!(s.purge_flagged_archives().await.unwrap(), 1);
  assert_eq!(s.partition_counts("old").await.unwrap().archived_records, 0);
}

#[tokio::test]
async fn latest_archive_run_wins() {
  let s = store().await;

  let first = ArchiveRun::start("old").fail("disk full");
  s.record_archive_run(first).await.unwrap();
  let second = ArchiveRun::start("old");
  s.record_archive_run(second.clone()).await.unwrap();
  s.record_archive_run(second.complete(3, 1)).await.unwrap();

  let last = s.last_archive_run("old").await.unwrap().unwrap();
  assert_eq!(last.state, ArchiveRunState::Completed);
  assert_eq!(last.archived_records, 3);
  assert!(s.last_archive_run("other").await.unwrap().is_none());
}

// ─── Failures ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn persist_failures_round_trip() {
  let s = store().await;
  let failure = PersistFailure {
    job_ref:       Uuid::new_v4(),
    owner_id:      "u1".into(),
    partition_key: "s1".into(),
    attempts:      3,
    last_error:    "database is locked".into(),
    responses:     vec![ReviewResponse::new("a", 1.0, Utc::now())],
    failed_at:     Utc::now(),
  };
  s.record_persist_failure(failure.clone()).await.unwrap();

  let listed = s.list_persist_failures(10).await.unwrap();
  assert_eq!(listed.len(), 1);
  assert_eq!(listed[0].job_ref, failure.job_ref);
  assert_eq!(listed[0].attempts, 3);
  assert_eq!(listed[0].responses.len(), 1);
}
