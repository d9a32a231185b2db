//! Normal/degraded mode tracking.
//!
//! Every read probes the cache under a short deadline. A probe that fails or
//! times out switches the engine to degraded mode; the next successful probe
//! switches it back. Cache operations that fail mid-request also flip the
//! mode without waiting for the next probe.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use serde::Serialize;

use crate::health::HealthCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
  Normal,
  Degraded,
}

pub struct ModeMonitor {
  health:   Arc<dyn HealthCheck>,
  timeout:  Duration,
  degraded: AtomicBool,
}

impl ModeMonitor {
  pub fn new(health: Arc<dyn HealthCheck>, timeout: Duration) -> Self {
    Self {
      health,
      timeout,
      degraded: AtomicBool::new(false),
    }
  }

  /// Probe the cache and return the resulting mode.
  pub async fn check(&self) -> Mode {
    let up = tokio::time::timeout(self.timeout, self.health.probe())
      .await
      .unwrap_or(false);
    if up {
      if self.degraded.swap(false, Ordering::SeqCst) {
        tracing::info!("cache reachable again; leaving degraded mode");
      }
      Mode::Normal
    } else {
      if !self.degraded.swap(true, Ordering::SeqCst) {
        tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "cache probe failed; entering degraded mode");
      }
      Mode::Degraded
    }
  }

  /// Record a cache failure observed outside of a probe.
  pub fn mark_unavailable(&self, reason: &str) {
    if !self.degraded.swap(true, Ordering::SeqCst) {
      tracing::warn!(%reason, "cache operation failed; entering degraded mode");
    }
  }

  /// The mode as of the last probe, without probing.
  pub fn mode(&self) -> Mode {
    if self.degraded.load(Ordering::SeqCst) {
      Mode::Degraded
    } else {
      Mode::Normal
    }
  }
}
