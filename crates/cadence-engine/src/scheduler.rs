//! Periodic background jobs.
//!
//! Each job runs on its own interval task; none of them holds a lock the read
//! or write paths wait on. A job that fails logs and waits for its next tick.

use std::{sync::Arc, time::Duration};

use cadence_core::store::ReviewStore;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::engine::Engine;

fn every<F, Fut>(
  name: &'static str,
  period: Duration,
  mut shutdown: watch::Receiver<bool>,
  mut job: F,
) -> JoinHandle<()>
where
  F: FnMut() -> Fut + Send + 'static,
  Fut: std::future::Future<Output = ()> + Send,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; jobs wait a full period.
    ticker.tick().await;
    tracing::debug!(job = name, period_secs = period.as_secs(), "scheduled job registered");
    loop {
      tokio::select! {
        _ = shutdown.changed() => break,
        _ = ticker.tick() => job().await,
      }
    }
    tracing::debug!(job = name, "scheduled job stopped");
  })
}

/// Start reconciliation, auto-archive, retention flagging and idle eviction
/// on the intervals in the engine's configuration.
pub fn spawn<S: ReviewStore + 'static>(
  engine: Arc<Engine<S>>,
  shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
  let config = engine.config().clone();
  let secs = Duration::from_secs;

  let reconcile = {
    let engine = engine.clone();
    every("reconcile", secs(config.reconcile_interval_secs), shutdown.clone(), move || {
      let engine = engine.clone();
      async move {
        if let Err(e) = engine.trigger_reconciliation(None).await {
          tracing::warn!(error = %e, "scheduled reconciliation failed");
        }
      }
    })
  };

  let auto_archive = {
    let engine = engine.clone();
    every("auto_archive", secs(config.auto_archive_interval_secs), shutdown.clone(), move || {
      let engine = engine.clone();
      async move {
        match engine.process_auto_archive().await {
          Ok(summary) if !summary.archived.is_empty() || !summary.failed.is_empty() => {
            tracing::info!(
              archived = summary.archived.len(),
              failed = summary.failed.len(),
              "auto-archive pass finished"
            );
          }
          Ok(_) => {}
          Err(e) => tracing::warn!(error = %e, "auto-archive pass failed"),
        }
      }
    })
  };

  let retention = {
    let engine = engine.clone();
    every("retention_flag", secs(config.retention_flag_interval_secs), shutdown.clone(), move || {
      let engine = engine.clone();
      async move {
        if let Err(e) = engine.flag_for_deletion().await {
          tracing::warn!(error = %e, "retention flagging failed");
        }
      }
    })
  };

  let evict = every("evict_idle", secs(config.eviction_interval_secs), shutdown, move || {
    let engine = engine.clone();
    async move {
      engine.evict_idle().await;
    }
  });

  vec![reconcile, auto_archive, retention, evict]
}
