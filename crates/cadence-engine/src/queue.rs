//! The persistence job queue.

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

use cadence_core::review::ReviewBatch;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// A batch waiting to be written to the durable store.
#[derive(Debug, Clone)]
pub struct PersistJob {
  pub batch:       ReviewBatch,
  pub enqueued_at: DateTime<Utc>,
}

impl PersistJob {
  pub fn new(batch: ReviewBatch) -> Self {
    Self { batch, enqueued_at: Utc::now() }
  }
}

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("persistence queue is closed")]
  Closed,
}

/// Where `submit` hands batches off to the worker pool.
pub trait JobQueue: Send + Sync {
  fn enqueue(&self, job: PersistJob) -> Result<(), QueueError>;
  /// Jobs enqueued but not yet taken by a worker.
  fn depth(&self) -> usize;
}

/// An in-process queue. See [`channel`].
#[derive(Debug, Clone)]
pub struct ChannelQueue {
  tx:    mpsc::UnboundedSender<PersistJob>,
  depth: Arc<AtomicUsize>,
}

/// The consuming half of a [`ChannelQueue`], shared by every worker.
#[derive(Debug)]
pub struct JobReceiver {
  rx:    Mutex<mpsc::UnboundedReceiver<PersistJob>>,
  depth: Arc<AtomicUsize>,
}

pub fn channel() -> (ChannelQueue, JobReceiver) {
  let (tx, rx) = mpsc::unbounded_channel();
  let depth = Arc::new(AtomicUsize::new(0));
  (
    ChannelQueue { tx, depth: depth.clone() },
    JobReceiver { rx: Mutex::new(rx), depth },
  )
}

impl JobQueue for ChannelQueue {
  fn enqueue(&self, job: PersistJob) -> Result<(), QueueError> {
    self.depth.fetch_add(1, Ordering::SeqCst);
    self.tx.send(job).map_err(|_| {
      self.depth.fetch_sub(1, Ordering::SeqCst);
      QueueError::Closed
    })
  }

  fn depth(&self) -> usize { self.depth.load(Ordering::SeqCst) }
}

impl JobReceiver {
  /// Wait for the next job; `None` once every sender is gone and the queue
  /// is drained.
  pub async fn recv(&self) -> Option<PersistJob> {
    let job = self.rx.lock().await.recv().await;
    if job.is_some() {
      self.depth.fetch_sub(1, Ordering::SeqCst);
    }
    job
  }

  pub async fn try_recv(&self) -> Option<PersistJob> {
    let job = self.rx.lock().await.try_recv().ok();
    if job.is_some() {
      self.depth.fetch_sub(1, Ordering::SeqCst);
    }
    job
  }
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  use super::*;

  fn job() -> PersistJob {
    PersistJob::new(ReviewBatch {
      job_ref:       Uuid::new_v4(),
      owner_id:      "u1".into(),
      partition_key: "s1".into(),
      reviewed_at:   Utc::now(),
      responses:     vec![],
    })
  }

  #[tokio::test]
  async fn depth_tracks_unconsumed_jobs() {
    let (queue, rx) = channel();
    queue.enqueue(job()).unwrap();
    queue.enqueue(job()).unwrap();
    assert_eq!(queue.depth(), 2);

    rx.recv().await.unwrap();
    assert_eq!(queue.depth(), 1);
    rx.try_recv().await.unwrap();
    assert_eq!(queue.depth(), 0);
    assert!(rx.try_recv().await.is_none());
  }

  #[tokio::test]
  async fn enqueue_after_receiver_dropped_fails() {
    let (queue, rx) = channel();
    drop(rx);
    assert!(matches!(queue.enqueue(job()), Err(QueueError::Closed)));
    assert_eq!(queue.depth(), 0);
  }
}
