//! Engine tuning knobs, deserialised from the `[engine]` table of the server
//! configuration. Every field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Deadline for a cache liveness probe.
  pub probe_timeout_ms:             u64,
  /// Items returned per degraded read, regardless of the requested limit.
  pub degraded_top_k:               usize,
  pub global_reads_per_minute:      u64,
  pub owner_min_interval_secs:      u64,
  pub persist_max_attempts:         u32,
  /// First retry delay; doubles on each further attempt.
  pub persist_backoff_base_ms:      u64,
  pub idempotency_window_secs:      u64,
  pub worker_count:                 usize,
  /// Queue depth at which a backlog alert fires.
  pub queue_warn_depth:             usize,
  pub reconcile_sample_size:        usize,
  /// Clock-skew tolerance when comparing cached and durable due times.
  pub reconcile_tolerance_ms:       i64,
  /// Discrepancy rate above which reconciliation alerts an operator.
  pub discrepancy_alert_rate:       f64,
  pub reconcile_interval_secs:      u64,
  pub auto_archive_interval_secs:   u64,
  pub retention_flag_interval_secs: u64,
  pub retention_days:               i64,
  /// Cache entries untouched for this long are evicted.
  pub cache_idle_ttl_secs:          u64,
  pub eviction_interval_secs:       u64,
  /// Cache keys removed per scan step while purging a partition.
  pub purge_batch_size:             usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      probe_timeout_ms:             250,
      degraded_top_k:               10,
      global_reads_per_minute:      500,
      owner_min_interval_secs:      30,
      persist_max_attempts:         3,
      persist_backoff_base_ms:      200,
      idempotency_window_secs:      300,
      worker_count:                 4,
      queue_warn_depth:             10_000,
      reconcile_sample_size:        10_000,
      reconcile_tolerance_ms:       1_000,
      discrepancy_alert_rate:       0.001,
      reconcile_interval_secs:      86_400,
      auto_archive_interval_secs:   86_400,
      retention_flag_interval_secs: 604_800,
      retention_days:               1_095,
      cache_idle_ttl_secs:          30 * 86_400,
      eviction_interval_secs:       3_600,
      purge_batch_size:             500,
    }
  }
}

impl EngineConfig {
  pub fn probe_timeout(&self) -> Duration { Duration::from_millis(self.probe_timeout_ms) }

  pub fn owner_min_interval(&self) -> Duration {
    Duration::from_secs(self.owner_min_interval_secs)
  }

  pub fn persist_backoff_base(&self) -> Duration {
    Duration::from_millis(self.persist_backoff_base_ms)
  }

  pub fn idempotency_window(&self) -> Duration {
    Duration::from_secs(self.idempotency_window_secs)
  }

  pub fn reconcile_tolerance(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.reconcile_tolerance_ms)
  }

  pub fn retention(&self) -> chrono::Duration { chrono::Duration::days(self.retention_days) }

  pub fn cache_idle_ttl(&self) -> Duration { Duration::from_secs(self.cache_idle_ttl_secs) }
}
