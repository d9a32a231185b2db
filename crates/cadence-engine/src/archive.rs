//! Archival of retired partitions and retention of archived records.

use std::sync::Arc;

use cadence_core::{
  partition::{ArchiveRun, PartitionCounts, PartitionEntity, PartitionFlags},
  review::ArchivedRecord,
  store::ReviewStore,
};
use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;

use crate::{
  alert::{Alert, AlertSink},
  cache::CacheIndex,
  error::{store_err, Error},
  Result,
};

/// Archived records included in [`ArchiveStatus::sample`].
const STATUS_SAMPLE: usize = 20;

/// Everything an operator needs to judge an archival.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStatus {
  pub partition:   PartitionEntity,
  pub counts:      PartitionCounts,
  pub last_run:    Option<ArchiveRun>,
  pub in_progress: bool,
  /// Set once a run has moved the partition to cold storage.
  pub archived:    bool,
  /// The most recently archived records, for spot checks.
  pub sample:      Vec<ArchivedRecord>,
}

/// Result of one pass of the auto-archive job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoArchiveSummary {
  pub archived: Vec<ArchiveRun>,
  /// (partition key, error) for every partition that failed this pass.
  pub failed:   Vec<(String, String)>,
}

/// Removes a partition from the running set when the run ends, however it
/// ends.
struct RunGuard<'a> {
  running: &'a DashSet<String>,
  key:     String,
}

impl Drop for RunGuard<'_> {
  fn drop(&mut self) { self.running.remove(&self.key); }
}

pub struct Archiver<S> {
  store:       Arc<S>,
  cache:       Arc<dyn CacheIndex>,
  alerts:      Arc<dyn AlertSink>,
  running:     DashSet<String>,
  purge_batch: usize,
  retention:   chrono::Duration,
}

impl<S: ReviewStore> Archiver<S> {
  pub fn new(
    store: Arc<S>,
    cache: Arc<dyn CacheIndex>,
    alerts: Arc<dyn AlertSink>,
    purge_batch: usize,
    retention: chrono::Duration,
  ) -> Self {
    Self {
      store,
      cache,
      alerts,
      running: DashSet::new(),
      purge_batch,
      retention,
    }
  }

  /// Operator-initiated archival. Refused without `confirm`.
  pub async fn archive_partition(&self, partition_key: &str, confirm: bool) -> Result<ArchiveRun> {
    if !confirm {
      return Err(Error::ConfirmationRequired);
    }
    self.run(partition_key).await
  }

  /// Move the partition's records to the archive, purge its cache footprint
  /// and stop caching it.
  ///
  /// The move is one transaction: on failure nothing is archived, the run is
  /// recorded as failed, an alert is raised, and the next scheduled pass
  /// tries again.
  async fn run(&self, partition_key: &str) -> Result<ArchiveRun> {
    let entity = self
      .store
      .get_partition(partition_key)
      .await
      .map_err(store_err)?
      .ok_or_else(|| Error::PartitionNotFound(partition_key.to_owned()))?;

    if !self.running.insert(partition_key.to_owned()) {
      return Err(Error::ArchiveInProgress(partition_key.to_owned()));
    }
    let _guard = RunGuard {
      running: &self.running,
      key:     partition_key.to_owned(),
    };

    let run = ArchiveRun::start(partition_key);
    self
      .store
      .record_archive_run(run.clone())
      .await
      .map_err(store_err)?;
    tracing::info!(%partition_key, run_id = %run.run_id, "archival started");

    let archived = match self
      .store
      .archive_partition_records(partition_key, Utc::now())
      .await
    {
      Ok(n) => n,
      Err(e) => return Err(self.fail(run, store_err(e)).await),
    };

    let purged = match self.cache.purge_partition(partition_key, self.purge_batch).await {
      Ok(n) => n,
      Err(e) => {
        // Orphaned keys are harmless; the idle sweep removes them.
        tracing::warn!(%partition_key, error = %e, "cache purge failed during archival");
        0
      }
    };

    if entity.caching_enabled {
      let flags = PartitionFlags {
        caching_enabled: Some(false),
        ..Default::default()
      };
      if let Err(e) = self.store.update_partition(partition_key, flags).await {
        return Err(self.fail(run, store_err(e)).await);
      }
    }

    let run = run.complete(archived, purged);
    self
      .store
      .record_archive_run(run.clone())
      .await
      .map_err(store_err)?;
    tracing::info!(
      %partition_key,
      run_id = %run.run_id,
      archived_records = archived,
      purged_cache_keys = purged,
      "archival completed"
    );
    Ok(run)
  }

  async fn fail(&self, run: ArchiveRun, error: Error) -> Error {
    let message = error.to_string();
    let partition_key = run.partition_key.clone();
    tracing::error!(%partition_key, run_id = %run.run_id, error = %message, "archival failed; rolled back");
    if let Err(e) = self.store.record_archive_run(run.fail(message.clone())).await {
      tracing::error!(%partition_key, error = %e, "could not record failed archive run");
    }
    self.alerts.raise(Alert::ArchivalFailed {
      partition_key,
      error: message,
    });
    error
  }

  /// Archive every retired partition flagged for auto-archive that still
  /// holds active records or is still cached.
  pub async fn process_auto_archive(&self) -> Result<AutoArchiveSummary> {
    let mut summary = AutoArchiveSummary::default();
    for entity in self.store.list_partitions().await.map_err(store_err)? {
      if !entity.awaiting_auto_archive() {
        continue;
      }
      let counts = self
        .store
        .partition_counts(&entity.partition_key)
        .await
        .map_err(store_err)?;
      if counts.active_records == 0 && !entity.caching_enabled {
        continue;
      }

      match self.run(&entity.partition_key).await {
        Ok(run) => summary.archived.push(run),
        Err(Error::ArchiveInProgress(_)) => {}
        Err(e) => summary.failed.push((entity.partition_key, e.to_string())),
      }
    }
    Ok(summary)
  }

  /// Flag archived records past the retention period. Never deletes.
  pub async fn flag_for_deletion(&self) -> Result<u64> {
    let cutoff = Utc::now() - self.retention;
    let flagged = self
      .store
      .flag_expired_archives(cutoff)
      .await
      .map_err(store_err)?;
    tracing::info!(flagged, %cutoff, "archived records flagged for deletion");
    Ok(flagged)
  }

  /// Physically delete flagged archived records. Refused without `confirm`.
  pub async fn purge_flagged(&self, confirm: bool) -> Result<u64> {
    if !confirm {
      return Err(Error::ConfirmationRequired);
    }
    let purged = self
      .store
      .purge_flagged_archives()
      .await
      .map_err(store_err)?;
    tracing::warn!(purged, "flagged archived records deleted");
    Ok(purged)
  }

  pub async fn status(&self, partition_key: &str) -> Result<ArchiveStatus> {
    let partition = self
      .store
      .get_partition(partition_key)
      .await
      .map_err(store_err)?
      .ok_or_else(|| Error::PartitionNotFound(partition_key.to_owned()))?;
    let counts = self
      .store
      .partition_counts(partition_key)
      .await
      .map_err(store_err)?;
    let last_run = self
      .store
      .last_archive_run(partition_key)
      .await
      .map_err(store_err)?;
    let archived = self
      .store
      .is_partition_archived(partition_key)
      .await
      .map_err(store_err)?;
    let sample = self
      .store
      .archived_records(partition_key, STATUS_SAMPLE)
      .await
      .map_err(store_err)?;
    Ok(ArchiveStatus {
      partition,
      counts,
      last_run,
      in_progress: self.running.contains(partition_key),
      archived,
      sample,
    })
  }
}
