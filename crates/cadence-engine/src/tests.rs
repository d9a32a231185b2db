//! End-to-end engine tests against an in-memory SQLite store.

use std::sync::Arc;

use cadence_core::{
  partition::{ArchiveRunState, NewPartition, PartitionFlags},
  review::{Classification, ClassificationFilter, ReviewBatch, ReviewResponse},
  store::ReviewStore,
};
use cadence_store_sqlite::SqliteStore;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
  alert::{Alert, MemoryAlerts},
  cache::{CacheIndex, CacheItem, CacheKey, MemoryIndex},
  fallback::Mode,
  health::StaticHealth,
  queue::{self, JobReceiver},
  worker::JobOutcome,
  Engine, EngineConfig, Error,
};

struct Harness {
  engine: Arc<Engine<SqliteStore>>,
  store:  Arc<SqliteStore>,
  cache:  Arc<MemoryIndex>,
  health: Arc<StaticHealth>,
  alerts: Arc<MemoryAlerts>,
  jobs:   JobReceiver,
}

fn fast_config() -> EngineConfig {
  EngineConfig {
    persist_backoff_base_ms: 1,
    ..EngineConfig::default()
  }
}

async fn harness() -> Harness { harness_with(fast_config()).await }

async fn harness_with(config: EngineConfig) -> Harness {
  let store = Arc::new(SqliteStore::open_in_memory().await.expect("store"));
  let cache = Arc::new(MemoryIndex::new());
  let health = Arc::new(StaticHealth::up());
  let alerts = Arc::new(MemoryAlerts::new());
  let (queue, jobs) = queue::channel();
  let engine = Engine::builder(store.clone(), config, Arc::new(queue))
    .with_cache(cache.clone())
    .with_health(health.clone())
    .with_alerts(alerts.clone())
    .build();
  Harness {
    engine: Arc::new(engine),
    store,
    cache,
    health,
    alerts,
    jobs,
  }
}

impl Harness {
  /// Run every queued persistence job to completion.
  async fn drain(&self) -> Vec<JobOutcome> {
    self.engine.persistence_worker().drain(&self.jobs).await
  }

  /// Write records straight to the durable store, as of a day ago.
  async fn seed(&self, owner: &str, partition: &str, responses: Vec<ReviewResponse>) {
    self
      .store
      .persist_batch(ReviewBatch {
        job_ref: Uuid::new_v4(),
        owner_id: owner.into(),
        partition_key: partition.into(),
        reviewed_at: Utc::now() - Duration::days(1),
        responses,
      })
      .await
      .expect("seed");
  }
}

fn at(offset: Duration) -> DateTime<Utc> { Utc::now() + offset }

fn ids(items: &crate::DueItems) -> Vec<&str> {
  items.items.iter().map(|i| i.item_id.as_str()).collect()
}

// ─── Read and write paths ────────────────────────────────────────────────────

#[tokio::test]
async fn rescheduled_item_leaves_due_set_immediately() {
  let h = harness().await;
  h.seed("U1", "S1", vec![
    ReviewResponse::new("A", 1.0, at(-Duration::minutes(1))),
    ReviewResponse::new("B", 1.0, at(Duration::hours(1))),
  ])
  .await;

  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert_eq!(ids(&due), ["A"]);
  assert!(!due.degraded);

  h.engine
    .submit("U1", "S1", vec![ReviewResponse::new("A", 2.0, at(Duration::days(2)))], None)
    .await
    .unwrap();
  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert!(due.items.is_empty());

  assert_eq!(h.drain().await, [JobOutcome::Persisted { rows: 1 }]);
  let a = h.store.get_review("U1", "S1", "A").await.unwrap().unwrap();
  assert!(a.next_review_at > at(Duration::days(1)));
  assert_eq!(a.stability_score, 2.0);
}

#[tokio::test]
async fn read_after_write_before_persistence() {
  let h = harness().await;
  h.engine
    .submit("U1", "S1", vec![ReviewResponse::new("X", 1.5, at(-Duration::seconds(1)))], None)
    .await
    .unwrap();

  assert!(h.store.get_review("U1", "S1", "X").await.unwrap().is_none());
  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert_eq!(ids(&due), ["X"]);
}

#[tokio::test]
async fn flushed_cache_is_rehydrated_from_durable_store() {
  let h = harness().await;
  h.seed("U1", "S1", vec![
    ReviewResponse::new("A", 1.0, at(-Duration::hours(3))),
    ReviewResponse::new("B", 1.0, at(-Duration::hours(2))),
    ReviewResponse::new("C", 1.0, at(Duration::hours(2))),
  ])
  .await;

  let first = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert_eq!(ids(&first), ["A", "B"]);
  assert_eq!(h.cache.stats("S1").await.unwrap().warm_keys, 1);

  h.cache.clear();
  let again = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert_eq!(again, first);
  assert_eq!(h.cache.stats("S1").await.unwrap().items, 3);
}

#[tokio::test]
async fn cold_write_does_not_hide_durable_items() {
  let h = harness().await;
  h.seed("U1", "S1", vec![ReviewResponse::new("old", 1.0, at(-Duration::hours(1)))]).await;
  h.engine
    .submit("U1", "S1", vec![ReviewResponse::new("new", 1.0, at(-Duration::minutes(1)))], None)
    .await
    .unwrap();

  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert_eq!(ids(&due), ["old", "new"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_of_cold_key_keep_concurrent_write() {
  let h = harness().await;
  h.seed("U1", "S1", vec![
    ReviewResponse::new("A", 1.0, at(-Duration::hours(3))),
    ReviewResponse::new("B", 1.0, at(-Duration::hours(2))),
    ReviewResponse::new("C", 1.0, at(Duration::hours(2))),
  ])
  .await;
  let rescheduled = at(Duration::days(2));

  let readers: Vec<_> = (0..8)
    .map(|_| {
      let engine = h.engine.clone();
      tokio::spawn(async move { engine.get_due("U1", "S1", 10, None).await })
    })
    .collect();
  let writer = {
    let engine = h.engine.clone();
    tokio::spawn(async move {
      engine
        .submit("U1", "S1", vec![ReviewResponse::new("A", 2.0, rescheduled)], None)
        .await
    })
  };

  writer.await.unwrap().unwrap();
  for reader in readers {
    let due = reader.await.unwrap().unwrap();
    assert!(!due.degraded);
    let seen = ids(&due);
    assert!(seen == ["A", "B"] || seen == ["B"], "unexpected due set {seen:?}");
  }

  let key = CacheKey::new("U1", "S1");
  assert_eq!(h.cache.score(&key, "A").await.unwrap(), Some(rescheduled));
  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert_eq!(ids(&due), ["B"]);
  assert_eq!(h.cache.stats("S1").await.unwrap().items, 3);
  assert_eq!(h.engine.hydrating_len(), 0);
}

#[tokio::test]
async fn invalid_submission_changes_nothing() {
  let h = harness().await;
  let err = h
    .engine
    .submit("U1", "S1", vec![ReviewResponse::new("A", 9.0, at(Duration::zero()))], None)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Invalid(_)));
  assert!(h.cache.score(&CacheKey::new("U1", "S1"), "A").await.unwrap().is_none());
  assert!(h.jobs.try_recv().await.is_none());
}

#[tokio::test]
async fn classification_filter_applies_in_both_modes() {
  let h = harness().await;
  let mut math = ReviewResponse::new("m", 1.0, at(-Duration::hours(1)));
  math.classification = Classification {
    subject: Some("math".into()),
    topic:   Some("fractions".into()),
  };
  h.seed("U1", "S1", vec![math, ReviewResponse::new("x", 1.0, at(-Duration::hours(2)))])
    .await;

  let filter = ClassificationFilter {
    subject: Some("math".into()),
    topic:   None,
  };
  let normal = h.engine.get_due("U1", "S1", 10, Some(&filter)).await.unwrap();
  assert_eq!(ids(&normal), ["m"]);

  h.health.set(false);
  let degraded = h.engine.get_due("U1", "S1", 10, Some(&filter)).await.unwrap();
  assert!(degraded.degraded);
  assert_eq!(ids(&degraded), ["m"]);
}

#[tokio::test]
async fn uncached_partition_is_served_from_durable_store() {
  let h = harness().await;
  h.engine
    .create_partition(
      NewPartition {
        caching_enabled: false,
        ..NewPartition::new("S9")
      },
      false,
    )
    .await
    .unwrap();
  h.seed("U1", "S9", vec![ReviewResponse::new("A", 1.0, at(-Duration::hours(1)))]).await;

  let due = h.engine.get_due("U1", "S9", 10, None).await.unwrap();
  assert_eq!(ids(&due), ["A"]);
  assert!(!due.degraded);
  assert_eq!(h.cache.stats("S9").await.unwrap().keys, 0);
}

// ─── Degraded mode ───────────────────────────────────────────────────────────

#[tokio::test]
async fn degraded_read_returns_top_ten_urgent() {
  let h = harness().await;
  let responses = (0..15)
    .map(|i| ReviewResponse::new(format!("i{i:02}"), 1.0, at(-Duration::hours(20 - i))))
    .collect();
  h.seed("U1", "S1", responses).await;

  h.health.set(false);
  let due = h.engine.get_due("U1", "S1", 50, None).await.unwrap();
  assert!(due.degraded);
  assert_eq!(due.items.len(), 10);
  assert_eq!(due.items[0].item_id, "i00");
  assert!(due.items.windows(2).all(|w| w[0].next_review_at <= w[1].next_review_at));
  assert_eq!(h.engine.mode(), Mode::Degraded);
}

#[tokio::test]
async fn recovers_to_normal_on_next_probe() {
  let h = harness().await;
  h.health.set(false);
  assert!(h.engine.get_due("U1", "S1", 10, None).await.unwrap().degraded);

  h.health.set(true);
  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert!(!due.degraded);
  assert_eq!(h.engine.mode(), Mode::Normal);
}

#[tokio::test]
async fn cache_failure_mid_read_falls_back() {
  let h = harness().await;
  h.seed("U1", "S1", vec![ReviewResponse::new("A", 1.0, at(-Duration::hours(1)))]).await;
  h.cache.set_online(false);

  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert!(due.degraded);
  assert_eq!(ids(&due), ["A"]);
}

#[tokio::test]
async fn degraded_reads_are_throttled() {
  let h = harness().await;
  h.health.set(false);

  let mut rejected = 0;
  for i in 0..501 {
    if let Err(Error::RateLimited { .. }) = h.engine.get_due(&format!("u{i}"), "S1", 10, None).await {
      rejected += 1;
    }
  }
  assert!(rejected >= 1);

  let h = harness().await;
  h.health.set(false);
  assert!(h.engine.get_due("U1", "S1", 10, None).await.is_ok());
  match h.engine.get_due("U1", "S1", 10, None).await {
    Err(Error::RateLimited { retry_after }) => assert!(retry_after.as_secs() <= 30),
    other => panic!("expected rate limit, got {other:?}"),
  }
}

// ─── Persistence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn exhausted_retries_land_in_failure_ledger() {
  let h = harness().await;
  h.store
    .execute_batch(
      "CREATE TRIGGER audit_down BEFORE INSERT ON review_audit
       BEGIN SELECT RAISE(ABORT, 'audit offline'); END;",
    )
    .await
    .unwrap();

  let submission = h
    .engine
    .submit("U1", "S1", vec![ReviewResponse::new("A", 1.0, at(-Duration::minutes(1)))], None)
    .await
    .unwrap();
  assert_eq!(h.drain().await, [JobOutcome::Failed { attempts: 3 }]);

  let failures = h.engine.persist_failures(10).await.unwrap();
  assert_eq!(failures.len(), 1);
  assert_eq!(failures[0].job_ref, submission.job_ref);
  assert!(failures[0].last_error.contains("audit offline"));
  assert!(h.store.get_review("U1", "S1", "A").await.unwrap().is_none());
  assert!(h
    .alerts
    .snapshot()
    .iter()
    .any(|a| matches!(a, Alert::PersistenceFailed { job_ref, .. } if *job_ref == submission.job_ref)));

  // The cache still carries the submitter's intent.
  let due = h.engine.get_due("U1", "S1", 10, None).await.unwrap();
  assert_eq!(ids(&due), ["A"]);
}

#[tokio::test]
async fn resubmission_within_window_is_ignored() {
  let h = harness().await;
  let responses = vec![ReviewResponse::new("A", 1.0, at(Duration::days(1)))];
  let first = h.engine.submit("U1", "S1", responses.clone(), None).await.unwrap();
  let second = h.engine.submit("U1", "S1", responses, None).await.unwrap();
  assert!(!first.duplicate);
  assert!(second.duplicate);
  assert_eq!(second.job_ref, first.job_ref);

  let keyed = h
    .engine
    .submit("U1", "S1", vec![ReviewResponse::new("B", 1.0, at(Duration::days(1)))], Some("k1"))
    .await
    .unwrap();
  let retried = h
    .engine
    .submit("U1", "S1", vec![ReviewResponse::new("B", 3.0, at(Duration::days(4)))], Some("k1"))
    .await
    .unwrap();
  assert_eq!(retried.job_ref, keyed.job_ref);

  assert_eq!(h.drain().await.len(), 2);
}

#[tokio::test]
async fn backlog_alert_fires_once_per_crossing() {
  let h = harness_with(EngineConfig {
    queue_warn_depth: 2,
    ..fast_config()
  })
  .await;
  for item in ["a", "b", "c"] {
    h.engine
      .submit("U1", "S1", vec![ReviewResponse::new(item, 1.0, at(Duration::days(1)))], None)
      .await
      .unwrap();
  }
  let backlog = h
    .alerts
    .snapshot()
    .iter()
    .filter(|a| matches!(a, Alert::QueueBacklog { .. }))
    .count();
  assert_eq!(backlog, 1);
}

// ─── Partitions ──────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_partition_creation_is_idempotent() {
  let h = harness().await;
  h.store
    .create_partition(NewPartition::new("2025-fall"))
    .await
    .unwrap()
    .unwrap();

  let tasks: Vec<_> = (0..16)
    .map(|_| {
      let engine = h.engine.clone();
      tokio::spawn(async move { engine.on_partition_created("2025-fall").await })
    })
    .collect();
  for task in tasks {
    task.await.unwrap().unwrap();
  }

  assert_eq!(h.store.list_storage_partitions().await.unwrap(), ["2025-fall"]);
  let entity = h.store.get_partition("2025-fall").await.unwrap().unwrap();
  assert!(entity.partition_created);
}

#[tokio::test]
async fn live_auto_archive_needs_confirmation() {
  let h = harness().await;
  let input = NewPartition {
    auto_archive_enabled: true,
    ..NewPartition::new("S1")
  };
  assert!(matches!(
    h.engine.create_partition(input.clone(), false).await,
    Err(Error::ActivePartition(_))
  ));
  let created = h.engine.create_partition(input, true).await.unwrap();
  assert!(created.partition_created);
  assert!(matches!(
    h.engine.create_partition(NewPartition::new("S1"), false).await,
    Err(Error::PartitionExists(_))
  ));

  h.engine.create_partition(NewPartition::new("S2"), false).await.unwrap();
  let enable = PartitionFlags {
    auto_archive_enabled: Some(true),
    ..Default::default()
  };
  assert!(matches!(
    h.engine.update_partition("S2", enable.clone(), false).await,
    Err(Error::ActivePartition(_))
  ));
  let retire = PartitionFlags {
    is_active: Some(false),
    ..enable
  };
  let updated = h.engine.update_partition("S2", retire, false).await.unwrap();
  assert!(updated.awaiting_auto_archive());
}

// ─── Reconciliation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reconciliation_corrects_desynced_entries() {
  let h = harness().await;
  for owner in 0..5 {
    let responses = (0..10)
      .map(|i| ReviewResponse::new(format!("i{i}"), 1.0, at(Duration::hours(i))))
      .collect();
    h.seed(&format!("u{owner}"), "S1", responses).await;
  }
  h.engine.rebuild_cache("S1").await.unwrap();

  let desynced: Vec<_> = (0..7).map(|n| (format!("u{}", n % 5), format!("i{n}"))).collect();
  for (owner, item) in &desynced {
    h.cache
      .upsert(&CacheKey::new(owner, "S1"), CacheItem {
        item_id:        item.clone(),
        due_at:         at(Duration::days(100)),
        classification: Classification::default(),
      })
      .await
      .unwrap();
  }

  let report = h.engine.trigger_reconciliation(Some(100)).await.unwrap();
  assert_eq!(report.sample_size, 50);
  assert_eq!(report.discrepancies, 7);
  assert!((report.discrepancy_rate - 7.0 / 50.0).abs() < f64::EPSILON);
  assert!(report.alerted);
  assert!(h
    .alerts
    .snapshot()
    .iter()
    .any(|a| matches!(a, Alert::ReconciliationDrift { discrepancies: 7, .. })));

  for (owner, item) in &desynced {
    let durable = h.store.get_review(owner, "S1", item).await.unwrap().unwrap();
    let cached = h.cache.score(&CacheKey::new(owner, "S1"), item).await.unwrap();
    assert_eq!(cached, Some(durable.next_review_at));
  }

  let clean = h.engine.trigger_reconciliation(Some(100)).await.unwrap();
  assert_eq!(clean.discrepancies, 0);
  assert!(!clean.alerted);
}

#[tokio::test]
async fn reconciliation_leaves_pending_writes_alone() {
  let h = harness().await;
  h.seed("U1", "S1", vec![ReviewResponse::new("A", 1.0, at(-Duration::hours(1)))]).await;
  let intent = at(Duration::days(2));
  h.engine
    .submit("U1", "S1", vec![ReviewResponse::new("A", 2.0, intent)], None)
    .await
    .unwrap();

  let report = h.engine.trigger_reconciliation(None).await.unwrap();
  assert_eq!(report.skipped_pending, 1);
  assert_eq!(report.discrepancies, 0);
  let cached = h.cache.score(&CacheKey::new("U1", "S1"), "A").await.unwrap();
  assert_eq!(cached, Some(intent));
}

#[tokio::test]
async fn rebuild_reports_progress_and_keeps_pending_scores() {
  let h = harness().await;
  for owner in ["u1", "u2", "u3"] {
    h.seed(owner, "S1", vec![
      ReviewResponse::new("A", 1.0, at(-Duration::hours(1))),
      ReviewResponse::new("B", 1.0, at(Duration::hours(1))),
    ])
    .await;
  }
  let intent = at(Duration::days(3));
  h.engine
    .submit("u1", "S1", vec![ReviewResponse::new("A", 3.0, intent)], None)
    .await
    .unwrap();

  let progress = h.engine.rebuild_cache("S1").await.unwrap();
  assert_eq!(progress.owners_total, 3);
  assert_eq!(progress.owners_done, 3);
  assert_eq!(progress.items_loaded, 6);
  assert_eq!(
    h.cache.score(&CacheKey::new("u1", "S1"), "A").await.unwrap(),
    Some(intent)
  );

  let status = h.engine.cache_status("S1").await.unwrap();
  assert_eq!(status.mode, Mode::Normal);
  assert_eq!(status.stats.map(|s| s.warm_keys), Some(3));
  assert_eq!(status.queue_depth, 1);
  assert_eq!(status.rebuild.map(|r| r.owners_done), Some(3));
}

// ─── Archival ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_archival_rolls_back_and_retries_cleanly() {
  let h = harness().await;
  h.engine.create_partition(NewPartition::new("old"), false).await.unwrap();
  for owner in ["u1", "u2"] {
    h.seed(owner, "old", vec![
      ReviewResponse::new("A", 1.0, at(-Duration::hours(1))),
      ReviewResponse::new("B", 1.0, at(Duration::hours(1))),
    ])
    .await;
    h.engine.get_due(owner, "old", 10, None).await.unwrap();
  }
  h.store
    .execute_batch(
      "CREATE TRIGGER archive_crash BEFORE DELETE ON review_records
       WHEN OLD.partition_key = 'old'
       BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .await
    .unwrap();

  assert!(h.engine.archive_partition("old", true).await.is_err());
  let status = h.engine.archive_status("old").await.unwrap();
  assert_eq!(status.counts.active_records, 4);
  assert_eq!(status.counts.archived_records, 0);
  assert_eq!(status.last_run.map(|r| r.state), Some(ArchiveRunState::Failed));
  assert!(!status.in_progress);
  assert!(!status.archived);
  assert!(status.sample.is_empty());
  assert!(status.partition.caching_enabled);
  assert!(h
    .alerts
    .snapshot()
    .iter()
    .any(|a| matches!(a, Alert::ArchivalFailed { .. })));

  h.store.execute_batch("DROP TRIGGER archive_crash;").await.unwrap();
  let run = h.engine.archive_partition("old", true).await.unwrap();
  assert_eq!(run.state, ArchiveRunState::Completed);
  assert_eq!(run.archived_records, 4);
  assert_eq!(run.purged_cache_keys, 2);

  let status = h.engine.archive_status("old").await.unwrap();
  assert_eq!(status.counts.active_records, 0);
  assert_eq!(status.counts.archived_records, 4);
  assert!(!status.partition.caching_enabled);
  assert_eq!(h.cache.stats("old").await.unwrap().keys, 0);
}

#[tokio::test]
async fn archived_partition_takes_no_more_writes() {
  let h = harness().await;
  h.engine.create_partition(NewPartition::new("old"), false).await.unwrap();
  h.seed("u1", "old", vec![ReviewResponse::new("A", 1.0, at(-Duration::hours(1)))]).await;
  h.engine
    .submit("u1", "old", vec![ReviewResponse::new("B", 1.0, at(-Duration::minutes(1)))], None)
    .await
    .unwrap();

  let run = h.engine.archive_partition("old", true).await.unwrap();
  assert_eq!(run.archived_records, 1);

  // Queued before the archive, persisted after it.
  assert_eq!(h.drain().await, [JobOutcome::Discarded]);
  assert!(h.store.get_review("u1", "old", "B").await.unwrap().is_none());

  let err = h
    .engine
    .submit("u1", "old", vec![ReviewResponse::new("C", 1.0, at(-Duration::minutes(1)))], None)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::PartitionArchived(ref p) if p == "old"));
  assert!(h.jobs.try_recv().await.is_none());
  assert_eq!(h.cache.stats("old").await.unwrap().keys, 0);

  let due = h.engine.get_due("u1", "old", 10, None).await.unwrap();
  assert!(due.items.is_empty());
  let status = h.engine.archive_status("old").await.unwrap();
  assert!(status.archived);
  assert_eq!(status.counts.active_records, 0);
  assert_eq!(status.counts.archived_records, 1);
  assert_eq!(status.sample.len(), 1);
  assert_eq!(status.sample[0].record.item_id, "A");
}

#[tokio::test]
async fn late_hydrate_of_archived_partition_is_dropped() {
  let h = harness().await;
  h.engine.create_partition(NewPartition::new("old"), false).await.unwrap();
  h.seed("u1", "old", vec![ReviewResponse::new("A", 1.0, at(-Duration::hours(1)))]).await;

  // Records moved while a reader still holds what it loaded: the cache is
  // left with a stale cold entry and caching is still on.
  h.store.archive_partition_records("old", Utc::now()).await.unwrap();
  let key = CacheKey::new("u1", "old");
  h.cache
    .upsert(&key, CacheItem {
      item_id:        "A".into(),
      due_at:         at(-Duration::hours(1)),
      classification: Classification::default(),
    })
    .await
    .unwrap();

  let due = h.engine.get_due("u1", "old", 10, None).await.unwrap();
  assert!(due.items.is_empty());
  assert_eq!(h.cache.stats("old").await.unwrap().keys, 0);
  assert_eq!(h.engine.hydrating_len(), 0);
}

#[tokio::test]
async fn destructive_operations_need_confirmation() {
  let h = harness().await;
  h.engine.create_partition(NewPartition::new("S1"), false).await.unwrap();
  assert!(matches!(
    h.engine.archive_partition("S1", false).await,
    Err(Error::ConfirmationRequired)
  ));
  assert!(matches!(
    h.engine.purge_flagged_archives(false).await,
    Err(Error::ConfirmationRequired)
  ));
  assert!(matches!(
    h.engine.archive_partition("missing", true).await,
    Err(Error::PartitionNotFound(_))
  ));
}

#[tokio::test]
async fn auto_archive_takes_only_retired_flagged_partitions() {
  let h = harness().await;
  h.engine.create_partition(NewPartition::new("2024"), false).await.unwrap();
  h.engine.create_partition(NewPartition::new("2025"), false).await.unwrap();
  for partition in ["2024", "2025"] {
    h.seed("u1", partition, vec![ReviewResponse::new("A", 1.0, at(Duration::hours(1)))])
      .await;
  }
  h.engine
    .update_partition(
      "2024",
      PartitionFlags {
        is_active:            Some(false),
        auto_archive_enabled: Some(true),
        ..Default::default()
      },
      false,
    )
    .await
    .unwrap();

  let summary = h.engine.process_auto_archive().await.unwrap();
  assert_eq!(summary.archived.len(), 1);
  assert_eq!(summary.archived[0].partition_key, "2024");
  assert!(summary.failed.is_empty());

  let again = h.engine.process_auto_archive().await.unwrap();
  assert!(again.archived.is_empty());
  assert_eq!(h.store.partition_counts("2025").await.unwrap().active_records, 1);
}

#[tokio::test]
async fn retention_flags_then_purges_on_confirmation() {
  let h = harness_with(EngineConfig {
    retention_days: 0,
    ..fast_config()
  })
  .await;
  h.engine.create_partition(NewPartition::new("old"), false).await.unwrap();
  h.seed("u1", "old", vec![
    ReviewResponse::new("A", 1.0, at(Duration::hours(1))),
    ReviewResponse::new("B", 1.0, at(Duration::hours(2))),
  ])
  .await;
  h.engine.archive_partition("old", true).await.unwrap();
  tokio::time::sleep(std::time::Duration::from_millis(20)).await;

  assert_eq!(h.engine.flag_for_deletion().await.unwrap(), 2);
  let counts = h.store.partition_counts("old").await.unwrap();
  assert_eq!(counts.flagged_for_deletion, 2);
  assert_eq!(counts.archived_records, 2);

  assert_eq!(h.engine.purge_flagged_archives(true).await.unwrap(), 2);
  assert_eq!(h.store.partition_counts("old").await.unwrap().archived_records, 0);
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_stops_on_shutdown() {
  let h = harness().await;
  let (tx, rx) = tokio::sync::watch::channel(false);
  let handles = crate::scheduler::spawn(h.engine.clone(), rx);
  assert_eq!(handles.len(), 4);

  tx.send(true).unwrap();
  for handle in handles {
    handle.await.unwrap();
  }
}
