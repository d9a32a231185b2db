//! Statistical reconciliation between the cache and the durable store.
//!
//! A run draws a random sample of active records and compares each durable
//! due time with the cached one. The durable store is authoritative: every
//! mismatch, including an item missing from the cache, is corrected through
//! the ordinary upsert path. Items with a persistence job still in flight are
//! skipped, since the cache is ahead of the store for them by design of
//! write-behind.

use std::sync::Arc;

use cadence_core::store::ReviewStore;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
  alert::{Alert, AlertSink},
  cache::{CacheIndex, CacheItem, CacheKey},
  error::store_err,
  pending::PendingWrites,
  Result,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
  /// Records actually drawn; may be fewer than requested.
  pub sample_size:      usize,
  pub discrepancies:    usize,
  /// Discrepancies where the cache had no score at all.
  pub missing:          usize,
  pub skipped_pending:  usize,
  pub discrepancy_rate: f64,
  pub alerted:          bool,
  pub started_at:       DateTime<Utc>,
  pub finished_at:      DateTime<Utc>,
}

pub struct Reconciler<S> {
  store:     Arc<S>,
  cache:     Arc<dyn CacheIndex>,
  pending:   Arc<PendingWrites>,
  alerts:    Arc<dyn AlertSink>,
  tolerance: chrono::Duration,
  threshold: f64,
}

impl<S: ReviewStore> Reconciler<S> {
  pub fn new(
    store: Arc<S>,
    cache: Arc<dyn CacheIndex>,
    pending: Arc<PendingWrites>,
    alerts: Arc<dyn AlertSink>,
    tolerance: chrono::Duration,
    threshold: f64,
  ) -> Self {
    Self { store, cache, pending, alerts, tolerance, threshold }
  }

  pub async fn run(&self, sample_size: usize) -> Result<ReconcileReport> {
    let started_at = Utc::now();
    let sample = self
      .store
      .sample_active(sample_size)
      .await
      .map_err(store_err)?;

    let mut discrepancies = 0;
    let mut missing = 0;
    let mut skipped_pending = 0;

    for record in &sample {
      let key = CacheKey::new(&record.owner_id, &record.partition_key);
      if self.pending.is_pending(&key, &record.item_id) {
        skipped_pending += 1;
        continue;
      }

      let in_sync = match self.cache.score(&key, &record.item_id).await? {
        Some(cached) => {
          let skew = cached - record.next_review_at;
          -self.tolerance <= skew && skew <= self.tolerance
        }
        None => {
          missing += 1;
          false
        }
      };
      if !in_sync {
        discrepancies += 1;
        self.cache.upsert(&key, CacheItem::from(record)).await?;
      }
    }

    let discrepancy_rate = if sample.is_empty() {
      0.0
    } else {
      discrepancies as f64 / sample.len() as f64
    };
    let alerted = discrepancy_rate > self.threshold;

    tracing::info!(
      sample_size = sample.len(),
      discrepancies,
      missing,
      skipped_pending,
      discrepancy_rate,
      "reconciliation finished"
    );
    if alerted {
      self.alerts.raise(Alert::ReconciliationDrift {
        sample_size: sample.len(),
        discrepancies,
        discrepancy_rate,
        threshold: self.threshold,
      });
    }

    Ok(ReconcileReport {
      sample_size: sample.len(),
      discrepancies,
      missing,
      skipped_pending,
      discrepancy_rate,
      alerted,
      started_at,
      finished_at: Utc::now(),
    })
  }
}
