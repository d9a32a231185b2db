//! Operator alerting.
//!
//! The engine raises an [`Alert`] whenever something needs a human: a batch
//! that never reached the durable store, a reconciliation run above the
//! discrepancy threshold, a failed archival, or a persistence backlog. Where
//! alerts go (email, pager, chat) is the embedding application's business;
//! it plugs in an [`AlertSink`].

use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
  PersistenceFailed {
    job_ref:       Uuid,
    owner_id:      String,
    partition_key: String,
    attempts:      u32,
    error:         String,
  },
  ReconciliationDrift {
    sample_size:      usize,
    discrepancies:    usize,
    discrepancy_rate: f64,
    threshold:        f64,
  },
  ArchivalFailed {
    partition_key: String,
    error:         String,
  },
  QueueBacklog {
    depth: usize,
  },
}

pub trait AlertSink: Send + Sync {
  fn raise(&self, alert: Alert);
}

/// Writes alerts to the `tracing` log at `ERROR` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
  fn raise(&self, alert: Alert) {
    match &alert {
      Alert::PersistenceFailed { job_ref, owner_id, partition_key, attempts, error } => {
        tracing::error!(
          %job_ref, %owner_id, %partition_key, attempts, %error,
          "ALERT: review batch not persisted; cache and durable store diverge"
        );
      }
      Alert::ReconciliationDrift { sample_size, discrepancies, discrepancy_rate, threshold } => {
        tracing::error!(
          sample_size, discrepancies, discrepancy_rate, threshold,
          "ALERT: cache drift above threshold"
        );
      }
      Alert::ArchivalFailed { partition_key, error } => {
        tracing::error!(%partition_key, %error, "ALERT: partition archival failed");
      }
      Alert::QueueBacklog { depth } => {
        tracing::error!(depth, "ALERT: persistence queue backlog");
      }
    }
  }
}

/// Keeps every alert in memory; handy for tests and for surfacing recent
/// alerts through an admin endpoint.
#[derive(Debug, Default)]
pub struct MemoryAlerts {
  alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlerts {
  pub fn new() -> Self { Self::default() }

  pub fn snapshot(&self) -> Vec<Alert> {
    self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
  }
}

impl AlertSink for MemoryAlerts {
  fn raise(&self, alert: Alert) {
    TracingAlerts.raise(alert.clone());
    if let Ok(mut alerts) = self.alerts.lock() {
      alerts.push(alert);
    }
  }
}
