//! The persistence worker pool.
//!
//! Workers take [`PersistJob`]s off the queue and write each batch to the
//! durable store in one transaction, retrying with exponential backoff. A
//! batch that still fails at the retry ceiling goes to the failure ledger and
//! raises an alert; the submitter already got its acceptance, so nothing is
//! reported back.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use cadence_core::{
  review::{PersistFailure, PersistOutcome},
  store::ReviewStore,
};
use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
  alert::{Alert, AlertSink},
  cache::CacheKey,
  pending::PendingWrites,
  queue::{JobReceiver, PersistJob},
};

// ─── Retry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles after that.
  pub base_delay:   Duration,
}

impl RetryPolicy {
  pub fn delay_after(&self, attempt: u32) -> Duration {
    self
      .base_delay
      .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
  }
}

/// The last error of an operation that failed on every attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
  pub attempts: u32,
  pub error:    E,
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached. `op` is
/// passed the attempt number, starting at 1.
pub async fn retry_with_backoff<T, E, F, Fut>(
  policy: RetryPolicy,
  mut op: F,
) -> Result<T, Exhausted<E>>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Display,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 1;
  loop {
    match op(attempt).await {
      Ok(value) => return Ok(value),
      Err(error) if attempt >= max_attempts => {
        return Err(Exhausted { attempts: attempt, error });
      }
      Err(error) => {
        let delay = policy.delay_after(attempt);
        tracing::warn!(
          attempt,
          max_attempts,
          delay_ms = delay.as_millis() as u64,
          %error,
          "attempt failed; backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
    }
  }
}

// ─── Worker ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
  Persisted { rows: usize },
  /// The durable store had already applied this job.
  Duplicate,
  /// The partition was archived after the job was queued; dropped.
  Discarded,
  Failed { attempts: u32 },
}

pub struct PersistenceWorker<S> {
  store:   Arc<S>,
  alerts:  Arc<dyn AlertSink>,
  pending: Arc<PendingWrites>,
  policy:  RetryPolicy,
}

impl<S> Clone for PersistenceWorker<S> {
  fn clone(&self) -> Self {
    Self {
      store:   self.store.clone(),
      alerts:  self.alerts.clone(),
      pending: self.pending.clone(),
      policy:  self.policy,
    }
  }
}

impl<S: ReviewStore> PersistenceWorker<S> {
  pub fn new(
    store: Arc<S>,
    alerts: Arc<dyn AlertSink>,
    pending: Arc<PendingWrites>,
    policy: RetryPolicy,
  ) -> Self {
    Self { store, alerts, pending, policy }
  }

  /// Persist one job. Never fails: exhaustion is recorded, not returned.
  pub async fn persist(&self, job: PersistJob) -> JobOutcome {
    let batch = &job.batch;
    let key = CacheKey::new(&batch.owner_id, &batch.partition_key);
    let store = &*self.store;

    let outcome = match retry_with_backoff(self.policy, move |_| {
      store.persist_batch(batch.clone())
    })
    .await
    {
      Ok(PersistOutcome::Applied { rows }) => {
        tracing::debug!(job_ref = %batch.job_ref, rows, "batch persisted");
        JobOutcome::Persisted { rows }
      }
      Ok(PersistOutcome::AlreadyApplied) => {
        tracing::debug!(job_ref = %batch.job_ref, "batch already persisted; skipped");
        JobOutcome::Duplicate
      }
      Ok(PersistOutcome::PartitionArchived) => {
        tracing::warn!(
          job_ref = %batch.job_ref,
          owner_id = %batch.owner_id,
          partition_key = %batch.partition_key,
          items = batch.responses.len(),
          "partition archived before batch persisted; discarded"
        );
        JobOutcome::Discarded
      }
      Err(Exhausted { attempts, error }) => {
        self.give_up(&job, attempts, error.to_string()).await;
        JobOutcome::Failed { attempts }
      }
    };

    self
      .pending
      .finish(&key, batch.responses.iter().map(|r| r.item_id.as_str()));
    outcome
  }

  async fn give_up(&self, job: &PersistJob, attempts: u32, error: String) {
    let batch = &job.batch;
    tracing::error!(
      job_ref = %batch.job_ref,
      owner_id = %batch.owner_id,
      partition_key = %batch.partition_key,
      attempts,
      %error,
      "batch not persisted after retry ceiling"
    );

    let failure = PersistFailure {
      job_ref:       batch.job_ref,
      owner_id:      batch.owner_id.clone(),
      partition_key: batch.partition_key.clone(),
      attempts,
      last_error:    error.clone(),
      responses:     batch.responses.clone(),
      failed_at:     Utc::now(),
    };
    if let Err(e) = self.store.record_persist_failure(failure).await {
      tracing::error!(job_ref = %batch.job_ref, error = %e, "could not record persistence failure");
    }

    self.alerts.raise(Alert::PersistenceFailed {
      job_ref: batch.job_ref,
      owner_id: batch.owner_id.clone(),
      partition_key: batch.partition_key.clone(),
      attempts,
      error,
    });
  }

  /// Persist every job currently queued, without waiting for more.
  pub async fn drain(&self, jobs: &JobReceiver) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();
    while let Some(job) = jobs.try_recv().await {
      outcomes.push(self.persist(job).await);
    }
    outcomes
  }
}

impl<S: ReviewStore + 'static> PersistenceWorker<S> {
  /// Start `workers` tasks consuming `jobs`. When `shutdown` fires each task
  /// finishes its current job, the queue is drained, and the tasks exit.
  pub fn spawn_pool(
    &self,
    jobs: Arc<JobReceiver>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
  ) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
      .map(|id| {
        let worker = self.clone();
        let jobs = jobs.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
          tracing::debug!(worker = id, "persistence worker started");
          loop {
            tokio::select! {
              biased;
              _ = shutdown.changed() => break,
              job = jobs.recv() => match job {
                Some(job) => { worker.persist(job).await; }
                None => break,
              },
            }
          }
          let drained = worker.drain(&jobs).await.len();
          tracing::debug!(worker = id, drained, "persistence worker stopped");
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;

  fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_delay: Duration::from_millis(200),
    }
  }

  #[test]
  fn delay_doubles() {
    let p = policy(5);
    assert_eq!(p.delay_after(1), Duration::from_millis(200));
    assert_eq!(p.delay_after(2), Duration::from_millis(400));
    assert_eq!(p.delay_after(3), Duration::from_millis(800));
  }

  #[tokio::test(start_paused = true)]
  async fn succeeds_after_transient_failures() {
    let calls = AtomicU32::new(0);
    let started = tokio::time::Instant::now();
    let result = retry_with_backoff(policy(3), |attempt| {
      calls.fetch_add(1, Ordering::SeqCst);
      async move { if attempt < 3 { Err("flaky") } else { Ok(attempt) } }
    })
    .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(600));
  }

  #[tokio::test(start_paused = true)]
  async fn gives_up_at_ceiling() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = retry_with_backoff(policy(3), |_| {
      calls.fetch_add(1, Ordering::SeqCst);
      async { Err("down") }
    })
    .await;

    let exhausted = result.unwrap_err();
    assert_eq!(exhausted.attempts, 3);
    assert_eq!(exhausted.error, "down");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }
}
