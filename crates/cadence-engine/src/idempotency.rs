//! Submit-time suppression of resubmitted batches.
//!
//! A batch is fingerprinted on the way in. A second submission with the same
//! fingerprint inside the window is answered with the original `job_ref`
//! instead of touching the cache or the queue again. The durable store keeps
//! its own guard (the audit trail) for jobs that run twice anyway.

use std::time::Duration;

use cadence_core::review::ReviewResponse;
use dashmap::{mapref::entry::Entry, DashMap};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

/// SHA-256 over a batch's identity. A caller-supplied idempotency key stands
/// in for the response contents.
pub fn fingerprint(
  owner_id: &str,
  partition_key: &str,
  responses: &[ReviewResponse],
  idempotency_key: Option<&str>,
) -> String {
  let mut hasher = Sha256::new();
  for part in [owner_id, partition_key] {
    hasher.update(part.as_bytes());
    hasher.update([0]);
  }
  match idempotency_key {
    Some(key) => {
      hasher.update(b"key\0");
      hasher.update(key.as_bytes());
    }
    None => {
      for r in responses {
        hasher.update(r.item_id.as_bytes());
        hasher.update([0]);
        hasher.update(r.stability_score.to_bits().to_be_bytes());
        hasher.update(r.next_review_at.timestamp_millis().to_be_bytes());
        for tag in [&r.classification.subject, &r.classification.topic] {
          hasher.update(tag.as_deref().unwrap_or("").as_bytes());
          hasher.update([0]);
        }
      }
    }
  }
  hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
  Fresh,
  /// Seen within the window; carries the original job reference.
  Duplicate(Uuid),
}

#[derive(Debug)]
pub struct IdempotencyWindow {
  window: Duration,
  seen:   DashMap<String, (Uuid, Instant)>,
}

impl IdempotencyWindow {
  pub fn new(window: Duration) -> Self {
    Self { window, seen: DashMap::new() }
  }

  /// Claim `fingerprint` for `job_ref` unless a live claim already exists.
  pub fn claim(&self, fingerprint: &str, job_ref: Uuid) -> Claim {
    let now = Instant::now();
    match self.seen.entry(fingerprint.to_owned()) {
      Entry::Occupied(mut e) => {
        let (original, at) = *e.get();
        if now.duration_since(at) < self.window {
          Claim::Duplicate(original)
        } else {
          e.insert((job_ref, now));
          Claim::Fresh
        }
      }
      Entry::Vacant(e) => {
        e.insert((job_ref, now));
        Claim::Fresh
      }
    }
  }

  /// Forget a claim whose submission didn't go through.
  pub fn release(&self, fingerprint: &str, job_ref: Uuid) {
    self.seen.remove_if(fingerprint, |_, (owner, _)| *owner == job_ref);
  }

  pub fn prune(&self) -> usize {
    let now = Instant::now();
    let before = self.seen.len();
    self
      .seen
      .retain(|_, (_, at)| now.duration_since(*at) < self.window);
    before.saturating_sub(self.seen.len())
  }
}
