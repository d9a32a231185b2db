//! [`Engine`], the entry point for reads, writes, and administration.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use cadence_core::{
  partition::{ArchiveRun, NewPartition, PartitionEntity, PartitionFlags},
  review::{
    ClassificationFilter, DueItem, DueQuery, PersistFailure, ReviewBatch, ReviewRecord,
    ReviewResponse,
  },
  store::ReviewStore,
};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
  alert::{Alert, AlertSink, TracingAlerts},
  archive::{ArchiveStatus, Archiver, AutoArchiveSummary},
  cache::{CacheIndex, CacheItem, CacheKey, MemoryIndex, PartitionStats},
  config::EngineConfig,
  error::{store_err, unavailable, Error},
  fallback::{Mode, ModeMonitor},
  health::{HealthCheck, IndexHealth},
  idempotency::{fingerprint, Claim, IdempotencyWindow},
  partition::PartitionManager,
  pending::PendingWrites,
  queue::{JobQueue, PersistJob},
  ratelimit::{CounterStore, MemoryCounters, RateLimiter},
  reconcile::{ReconcileReport, Reconciler},
  worker::{PersistenceWorker, RetryPolicy},
  Result,
};

// ─── Responses ───────────────────────────────────────────────────────────────

/// The answer to [`Engine::get_due`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueItems {
  pub items:    Vec<DueItem>,
  /// Set when the items came from the durable store's urgent-only fallback.
  pub degraded: bool,
}

/// The answer to [`Engine::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
  pub accepted:  bool,
  /// Reference of the persistence job carrying the batch.
  pub job_ref:   Uuid,
  /// The batch repeated one seen within the idempotency window; `job_ref` is
  /// the original's.
  pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildState {
  Running,
  Completed,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildProgress {
  pub partition_key: String,
  pub state:         RebuildState,
  pub owners_total:  usize,
  pub owners_done:   usize,
  pub items_loaded:  usize,
  pub started_at:    DateTime<Utc>,
  pub finished_at:   Option<DateTime<Utc>>,
  pub error:         Option<String>,
}

impl RebuildProgress {
  fn start(partition_key: &str) -> Self {
    Self {
      partition_key: partition_key.to_owned(),
      state:         RebuildState::Running,
      owners_total:  0,
      owners_done:   0,
      items_loaded:  0,
      started_at:    Utc::now(),
      finished_at:   None,
      error:         None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
  pub partition_key:   String,
  pub mode:            Mode,
  /// `None` when the cache couldn't be reached.
  pub stats:           Option<PartitionStats>,
  pub caching_enabled: bool,
  pub queue_depth:     usize,
  pub pending_writes:  usize,
  pub rebuild:         Option<RebuildProgress>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
  pub cache_entries:    u64,
  pub counters:         usize,
  pub idempotency_keys: usize,
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct EngineBuilder<S> {
  store:    Arc<S>,
  config:   EngineConfig,
  queue:    Arc<dyn JobQueue>,
  cache:    Option<Arc<dyn CacheIndex>>,
  health:   Option<Arc<dyn HealthCheck>>,
  counters: Option<Arc<dyn CounterStore>>,
  alerts:   Option<Arc<dyn AlertSink>>,
}

impl<S: ReviewStore> EngineBuilder<S> {
  /// Use `cache` instead of a fresh [`MemoryIndex`].
  pub fn with_cache(mut self, cache: Arc<dyn CacheIndex>) -> Self {
    self.cache = Some(cache);
    self
  }

  /// Probe `health` instead of the cache itself.
  pub fn with_health(mut self, health: Arc<dyn HealthCheck>) -> Self {
    self.health = Some(health);
    self
  }

  pub fn with_counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
    self.counters = Some(counters);
    self
  }

  pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
    self.alerts = Some(alerts);
    self
  }

  pub fn build(self) -> Engine<S> {
    let config = self.config;
    let cache = self
      .cache
      .unwrap_or_else(|| Arc::new(MemoryIndex::new()));
    let health = self
      .health
      .unwrap_or_else(|| Arc::new(IndexHealth::new(cache.clone())));
    let counters = self
      .counters
      .unwrap_or_else(|| Arc::new(MemoryCounters::new()));
    let alerts = self.alerts.unwrap_or_else(|| Arc::new(TracingAlerts));
    let pending = Arc::new(PendingWrites::new());

    Engine {
      monitor: ModeMonitor::new(health, config.probe_timeout()),
      limiter: RateLimiter::new(
        counters,
        config.global_reads_per_minute,
        config.owner_min_interval(),
      ),
      idempotency: IdempotencyWindow::new(config.idempotency_window()),
      partitions: PartitionManager::new(self.store.clone()),
      reconciler: Reconciler::new(
        self.store.clone(),
        cache.clone(),
        pending.clone(),
        alerts.clone(),
        config.reconcile_tolerance(),
        config.discrepancy_alert_rate,
      ),
      archiver: Archiver::new(
        self.store.clone(),
        cache.clone(),
        alerts.clone(),
        config.purge_batch_size,
        config.retention(),
      ),
      store: self.store,
      queue: self.queue,
      cache,
      pending,
      alerts,
      hydrating: DashMap::new(),
      rebuilds: DashMap::new(),
      backlog_alerted: AtomicBool::new(false),
      config,
    }
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Schedules, caches and persists review data for every owner and partition.
///
/// Reads go to the cache; a cold key is rehydrated from the durable store on
/// first read, and an unreachable cache switches reads to a throttled,
/// urgent-only query against the durable store. Writes land in the cache
/// before `submit` returns and reach the durable store through the job
/// queue.
pub struct Engine<S> {
  config:          EngineConfig,
  store:           Arc<S>,
  cache:           Arc<dyn CacheIndex>,
  queue:           Arc<dyn JobQueue>,
  alerts:          Arc<dyn AlertSink>,
  pending:         Arc<PendingWrites>,
  monitor:         ModeMonitor,
  limiter:         RateLimiter,
  idempotency:     IdempotencyWindow,
  partitions:      PartitionManager<S>,
  reconciler:      Reconciler<S>,
  archiver:        Archiver<S>,
  /// One lock per key being rehydrated, so concurrent misses load it once.
  hydrating:       DashMap<CacheKey, Arc<Mutex<()>>>,
  rebuilds:        DashMap<String, RebuildProgress>,
  backlog_alerted: AtomicBool,
}

fn check_scope(owner_id: &str, partition_key: &str) -> Result<()> {
  if owner_id.is_empty() {
    return Err(cadence_core::Error::EmptyOwner.into());
  }
  if partition_key.is_empty() {
    return Err(cadence_core::Error::EmptyPartitionKey.into());
  }
  Ok(())
}

/// Due items computed straight from durable records.
fn due_from_records(
  records: &[ReviewRecord],
  now: DateTime<Utc>,
  limit: usize,
  filter: &ClassificationFilter,
) -> Vec<DueItem> {
  let mut due: Vec<DueItem> = records
    .iter()
    .filter(|r| r.next_review_at <= now && filter.matches(&r.classification))
    .cloned()
    .map(DueItem::from)
    .collect();
  due.sort_by(|a, b| a.next_review_at.cmp(&b.next_review_at));
  due.truncate(limit);
  due
}

impl<S: ReviewStore> Engine<S> {
  pub fn builder(store: Arc<S>, config: EngineConfig, queue: Arc<dyn JobQueue>) -> EngineBuilder<S> {
    EngineBuilder {
      store,
      config,
      queue,
      cache: None,
      health: None,
      counters: None,
      alerts: None,
    }
  }

  pub fn config(&self) -> &EngineConfig { &self.config }

  /// Keys with a rehydration lock currently allocated.
  #[cfg(test)]
  pub(crate) fn hydrating_len(&self) -> usize { self.hydrating.len() }

  /// The mode as of the last probe.
  pub fn mode(&self) -> Mode { self.monitor.mode() }

  /// A worker sharing this engine's store, alerts and pending-write set.
  pub fn persistence_worker(&self) -> PersistenceWorker<S> {
    PersistenceWorker::new(
      self.store.clone(),
      self.alerts.clone(),
      self.pending.clone(),
      RetryPolicy {
        max_attempts: self.config.persist_max_attempts,
        base_delay:   self.config.persist_backoff_base(),
      },
    )
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Up to `limit` items due now for one owner, earliest first.
  pub async fn get_due(
    &self,
    owner_id: &str,
    partition_key: &str,
    limit: usize,
    filter: Option<&ClassificationFilter>,
  ) -> Result<DueItems> {
    check_scope(owner_id, partition_key)?;
    let filter = filter.cloned().unwrap_or_default();
    let now = Utc::now();

    if self.monitor.check().await == Mode::Degraded {
      return self.degraded_read(owner_id, partition_key, limit, filter, now).await;
    }

    let key = CacheKey::new(owner_id, partition_key);
    let cached = self.cache.due_items(&key, now, limit, &filter).await;
    match cached {
      Ok(Some(items)) => return Ok(DueItems { items, degraded: false }),
      Ok(None) => {}
      Err(e) => {
        self.monitor.mark_unavailable(&e.to_string());
        return self.degraded_read(owner_id, partition_key, limit, filter, now).await;
      }
    }

    let lock = self.hydrating.entry(key.clone()).or_default().clone();
    let result = {
      let _held = lock.lock().await;
      self.rehydrate(&key, now, limit, filter).await
    };
    // Whoever drops the last outside handle removes the entry.
    drop(lock);
    self
      .hydrating
      .remove_if(&key, |_, l| Arc::strong_count(l) == 1);
    result
  }

  /// Load a missing or cold key from the durable store and answer from it.
  async fn rehydrate(
    &self,
    key: &CacheKey,
    now: DateTime<Utc>,
    limit: usize,
    filter: ClassificationFilter,
  ) -> Result<DueItems> {
    let (owner_id, partition_key) = (key.owner_id.as_str(), key.partition_key.as_str());

    // Another request may have loaded it while we waited for the lock.
    let cached = self.cache.due_items(key, now, limit, &filter).await;
    match cached {
      Ok(Some(items)) => return Ok(DueItems { items, degraded: false }),
      Ok(None) => {}
      Err(e) => {
        self.monitor.mark_unavailable(&e.to_string());
        return self.degraded_read(owner_id, partition_key, limit, filter, now).await;
      }
    }

    let caching = self
      .partitions
      .caching_enabled(partition_key)
      .await
      .map_err(|e| Error::Unavailable(e.to_string()))?;
    if !caching {
      let query = DueQuery {
        owner_id:      owner_id.to_owned(),
        partition_key: partition_key.to_owned(),
        due_before:    now,
        limit,
        filter,
      };
      let records = self.store.top_due(&query).await.map_err(unavailable)?;
      return Ok(DueItems {
        items:    records.into_iter().map(DueItem::from).collect(),
        degraded: false,
      });
    }

    let records = self
      .store
      .load_owner(owner_id, partition_key)
      .await
      .map_err(unavailable)?;
    let items = records.iter().map(CacheItem::from).collect();
    match self.cache.hydrate(key, items).await {
      Ok(added) => {
        tracing::debug!(%owner_id, %partition_key, loaded = records.len(), added, "cache rehydrated");
      }
      Err(e) => {
        self.monitor.mark_unavailable(&e.to_string());
        return self.degraded_read(owner_id, partition_key, limit, filter, now).await;
      }
    }

    // The partition may have been archived, and its cache purged, between
    // the load and the hydrate. Archival is marked before the purge.
    let archived = self
      .partitions
      .is_archived(partition_key)
      .await
      .map_err(|e| Error::Unavailable(e.to_string()))?;
    if archived {
      if let Err(e) = self
        .cache
        .purge_partition(partition_key, self.config.purge_batch_size)
        .await
      {
        tracing::warn!(%partition_key, error = %e, "could not drop entries of archived partition");
      }
      tracing::info!(%owner_id, %partition_key, "read of archived partition; entries dropped");
      return Ok(DueItems { items: Vec::new(), degraded: false });
    }

    let cached = self.cache.due_items(key, now, limit, &filter).await;
    match cached {
      Ok(Some(items)) => Ok(DueItems { items, degraded: false }),
      // Evicted again already; the records are still in hand.
      Ok(None) => Ok(DueItems {
        items:    due_from_records(&records, now, limit, &filter),
        degraded: false,
      }),
      Err(e) => {
        self.monitor.mark_unavailable(&e.to_string());
        self.degraded_read(owner_id, partition_key, limit, filter, now).await
      }
    }
  }

  /// Serve the most urgent items straight from the durable store, subject to
  /// the degraded-mode throttles.
  async fn degraded_read(
    &self,
    owner_id: &str,
    partition_key: &str,
    limit: usize,
    filter: ClassificationFilter,
    now: DateTime<Utc>,
  ) -> Result<DueItems> {
    if let Err(throttled) = self.limiter.check(owner_id) {
      tracing::warn!(
        %owner_id,
        scope = ?throttled.scope,
        retry_after_ms = throttled.retry_after.as_millis() as u64,
        "degraded read throttled"
      );
      return Err(Error::RateLimited { retry_after: throttled.retry_after });
    }

    let query = DueQuery {
      owner_id:      owner_id.to_owned(),
      partition_key: partition_key.to_owned(),
      due_before:    now,
      limit:         limit.min(self.config.degraded_top_k),
      filter,
    };
    let records = self.store.top_due(&query).await.map_err(unavailable)?;
    tracing::warn!(%owner_id, %partition_key, served = records.len(), "degraded read");
    Ok(DueItems {
      items:    records.into_iter().map(DueItem::from).collect(),
      degraded: true,
    })
  }

  // ── Writes ────────────────────────────────────────────────────────────

  /// Accept a batch of scored responses.
  ///
  /// The cache reflects the batch before this returns; persistence happens
  /// on the worker pool. A batch identical to one submitted within the
  /// idempotency window (or carrying the same `idempotency_key`) is
  /// acknowledged with the original `job_ref` and otherwise ignored.
  pub async fn submit(
    &self,
    owner_id: &str,
    partition_key: &str,
    responses: Vec<ReviewResponse>,
    idempotency_key: Option<&str>,
  ) -> Result<Submission> {
    let batch = ReviewBatch {
      job_ref: Uuid::new_v4(),
      owner_id: owner_id.to_owned(),
      partition_key: partition_key.to_owned(),
      reviewed_at: Utc::now(),
      responses,
    };
    batch.validate()?;

    // The durable write re-checks this in its own transaction, so a store
    // outage here only skips the early refusal.
    match self.partitions.is_archived(partition_key).await {
      Ok(true) => return Err(Error::PartitionArchived(partition_key.to_owned())),
      Ok(false) => {}
      Err(e) => {
        tracing::warn!(%owner_id, %partition_key, error = %e, "archive check skipped");
      }
    }

    let fp = fingerprint(owner_id, partition_key, &batch.responses, idempotency_key);
    if let Claim::Duplicate(original) = self.idempotency.claim(&fp, batch.job_ref) {
      tracing::info!(%owner_id, %partition_key, job_ref = %original, "duplicate submission ignored");
      return Ok(Submission {
        accepted:  true,
        job_ref:   original,
        duplicate: true,
      });
    }

    let key = CacheKey::new(owner_id, partition_key);
    let item_ids: Vec<String> = batch.responses.iter().map(|r| r.item_id.clone()).collect();
    self.pending.begin(&key, item_ids.iter().map(String::as_str));

    let items: Vec<CacheItem> = batch.responses.iter().map(CacheItem::from).collect();
    if let Err(e) = self.cache.upsert_batch(&key, &items).await {
      // The durable write still goes ahead; a later rehydration picks it up.
      self.monitor.mark_unavailable(&e.to_string());
      tracing::warn!(%owner_id, %partition_key, error = %e, "cache write skipped");
    }

    let job_ref = batch.job_ref;
    if let Err(e) = self.queue.enqueue(PersistJob::new(batch)) {
      self.pending.finish(&key, item_ids.iter().map(String::as_str));
      self.idempotency.release(&fp, job_ref);
      tracing::error!(%owner_id, %partition_key, error = %e, "could not enqueue batch");
      return Err(Error::Unavailable(e.to_string()));
    }
    tracing::debug!(%owner_id, %partition_key, %job_ref, items = item_ids.len(), "batch accepted");

    self.watch_backlog();
    Ok(Submission {
      accepted: true,
      job_ref,
      duplicate: false,
    })
  }

  fn watch_backlog(&self) {
    let depth = self.queue.depth();
    if depth >= self.config.queue_warn_depth {
      if !self.backlog_alerted.swap(true, Ordering::SeqCst) {
        self.alerts.raise(Alert::QueueBacklog { depth });
      }
    } else {
      self.backlog_alerted.store(false, Ordering::SeqCst);
    }
  }

  // ── Partitions ────────────────────────────────────────────────────────

  /// Lifecycle hook: run when a partition entity is first persisted.
  pub async fn on_partition_created(&self, partition_key: &str) -> Result<()> {
    self.partitions.ensure_partition(partition_key).await
  }

  pub async fn ensure_partition(&self, partition_key: &str) -> Result<()> {
    self.partitions.ensure_partition(partition_key).await
  }

  pub async fn create_partition(&self, input: NewPartition, confirm: bool) -> Result<PartitionEntity> {
    self.partitions.create_partition(input, confirm).await
  }

  pub async fn update_partition(
    &self,
    partition_key: &str,
    flags: PartitionFlags,
    confirm: bool,
  ) -> Result<PartitionEntity> {
    self.partitions.update_flags(partition_key, flags, confirm).await
  }

  pub async fn list_partitions(&self) -> Result<Vec<PartitionEntity>> {
    self.partitions.list().await
  }

  // ── Cache administration ──────────────────────────────────────────────

  pub async fn cache_status(&self, partition_key: &str) -> Result<CacheStatus> {
    let mode = self.monitor.check().await;
    let stats = match mode {
      Mode::Normal => self.cache.stats(partition_key).await.ok(),
      Mode::Degraded => None,
    };
    let caching_enabled = self.partitions.caching_enabled(partition_key).await?;
    let rebuild = self.rebuilds.get(partition_key).map(|p| p.clone());
    Ok(CacheStatus {
      partition_key: partition_key.to_owned(),
      mode,
      stats,
      caching_enabled,
      queue_depth: self.queue.depth(),
      pending_writes: self.pending.len(),
      rebuild,
    })
  }

  /// Reload every owner of `partition_key` from the durable store, replacing
  /// what the cache holds. Items with a persistence job in flight keep their
  /// cached score.
  pub async fn rebuild_cache(&self, partition_key: &str) -> Result<RebuildProgress> {
    if partition_key.is_empty() {
      return Err(cadence_core::Error::EmptyPartitionKey.into());
    }
    match self.rebuilds.entry(partition_key.to_owned()) {
      Entry::Occupied(e) if e.get().state == RebuildState::Running => {
        return Err(Error::RebuildInProgress(partition_key.to_owned()));
      }
      Entry::Occupied(mut e) => {
        e.insert(RebuildProgress::start(partition_key));
      }
      Entry::Vacant(e) => {
        e.insert(RebuildProgress::start(partition_key));
      }
    }
    tracing::info!(%partition_key, "cache rebuild started");

    let result = self.rebuild_owners(partition_key).await;
    let mut progress = self
      .rebuilds
      .get(partition_key)
      .map(|p| p.clone())
      .unwrap_or_else(|| RebuildProgress::start(partition_key));
    progress.finished_at = Some(Utc::now());
    match &result {
      Ok(()) => {
        progress.state = RebuildState::Completed;
        tracing::info!(
          %partition_key,
          owners = progress.owners_done,
          items = progress.items_loaded,
          "cache rebuild completed"
        );
      }
      Err(e) => {
        progress.state = RebuildState::Failed;
        progress.error = Some(e.to_string());
        tracing::error!(%partition_key, error = %e, "cache rebuild failed");
      }
    }
    self.rebuilds.insert(partition_key.to_owned(), progress.clone());
    result.map(|()| progress)
  }

  async fn rebuild_owners(&self, partition_key: &str) -> Result<()> {
    let owners = self
      .store
      .owners_in_partition(partition_key)
      .await
      .map_err(store_err)?;
    if let Some(mut p) = self.rebuilds.get_mut(partition_key) {
      p.owners_total = owners.len();
    }

    for owner_id in owners {
      let records = self
        .store
        .load_owner(&owner_id, partition_key)
        .await
        .map_err(store_err)?;
      let key = CacheKey::new(owner_id, partition_key);
      let preserve = self.pending.items_for(&key);
      let items = records.iter().map(CacheItem::from).collect();
      if let Err(e) = self.cache.replace(&key, items, &preserve).await {
        self.monitor.mark_unavailable(&e.to_string());
        return Err(e.into());
      }
      if let Some(mut p) = self.rebuilds.get_mut(partition_key) {
        p.owners_done += 1;
        p.items_loaded += records.len();
      }
    }
    Ok(())
  }

  /// Run one reconciliation pass now. `None` uses the configured sample size.
  pub async fn trigger_reconciliation(&self, sample_size: Option<usize>) -> Result<ReconcileReport> {
    if self.monitor.check().await == Mode::Degraded {
      return Err(Error::Unavailable("cache unavailable; reconciliation skipped".into()));
    }
    let sample_size = sample_size.unwrap_or(self.config.reconcile_sample_size);
    self.reconciler.run(sample_size).await.inspect_err(|e| {
      if let Error::Cache(cache) = e {
        self.monitor.mark_unavailable(&cache.to_string());
      }
    })
  }

  /// Drop idle cache entries, expired rate-limit counters and expired
  /// idempotency claims.
  pub async fn evict_idle(&self) -> EvictionReport {
    let cache_entries = match self.cache.evict_idle(self.config.cache_idle_ttl()).await {
      Ok(n) => n,
      Err(e) => {
        self.monitor.mark_unavailable(&e.to_string());
        0
      }
    };
    let report = EvictionReport {
      cache_entries,
      counters: self.limiter.prune(),
      idempotency_keys: self.idempotency.prune(),
    };
    tracing::debug!(?report, "idle state evicted");
    report
  }

  // ── Archival ──────────────────────────────────────────────────────────

  pub async fn archive_partition(&self, partition_key: &str, confirm: bool) -> Result<ArchiveRun> {
    self.archiver.archive_partition(partition_key, confirm).await
  }

  pub async fn archive_status(&self, partition_key: &str) -> Result<ArchiveStatus> {
    self.archiver.status(partition_key).await
  }

  pub async fn process_auto_archive(&self) -> Result<AutoArchiveSummary> {
    self.archiver.process_auto_archive().await
  }

  pub async fn flag_for_deletion(&self) -> Result<u64> {
    self.archiver.flag_for_deletion().await
  }

  pub async fn purge_flagged_archives(&self, confirm: bool) -> Result<u64> {
    self.archiver.purge_flagged(confirm).await
  }

  // ── Persistence failures ──────────────────────────────────────────────

  pub async fn persist_failures(&self, limit: usize) -> Result<Vec<PersistFailure>> {
    self
      .store
      .list_persist_failures(limit)
      .await
      .map_err(store_err)
  }
}
