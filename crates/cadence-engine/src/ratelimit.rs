//! Throttles for degraded-mode reads.
//!
//! Two independent fixed-window counters: a per-owner spacing window (one
//! read per `owner_min_interval`) and a global one-minute ceiling. A read over
//! either is rejected outright with the time left in the offending window.
//! Counters live behind [`CounterStore`] so they can sit in the cache
//! technology itself or, as here, in process memory.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const GLOBAL_KEY: &str = "degraded:global";
const GLOBAL_WINDOW: Duration = Duration::from_secs(60);

/// A counter's value after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
  pub count:     u64,
  /// Time until the counter's window closes.
  pub resets_in: Duration,
}

/// Windowed counters. Increments on an expired or absent key start a new
/// window of length `window`.
pub trait CounterStore: Send + Sync {
  fn increment(&self, key: &str, window: Duration) -> Counter;
  fn get(&self, key: &str) -> Option<Counter>;
  fn expire(&self, key: &str);
  /// Drop every expired counter; returns how many went.
  fn prune(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryCounters {
  counters: DashMap<String, (u64, Instant)>,
}

impl MemoryCounters {
  pub fn new() -> Self { Self::default() }
}

impl CounterStore for MemoryCounters {
  fn increment(&self, key: &str, window: Duration) -> Counter {
    let now = Instant::now();
    let mut slot = self
      .counters
      .entry(key.to_owned())
      .or_insert((0, now + window));
    if slot.1 <= now {
      *slot = (0, now + window);
    }
    slot.0 += 1;
    Counter {
      count:     slot.0,
      resets_in: slot.1.saturating_duration_since(now),
    }
  }

  fn get(&self, key: &str) -> Option<Counter> {
    let now = Instant::now();
    self
      .counters
      .get(key)
      .filter(|slot| slot.1 > now)
      .map(|slot| Counter {
        count:     slot.0,
        resets_in: slot.1.saturating_duration_since(now),
      })
  }

  fn expire(&self, key: &str) { self.counters.remove(key); }

  fn prune(&self) -> usize {
    let now = Instant::now();
    let before = self.counters.len();
    self.counters.retain(|_, slot| slot.1 > now);
    before.saturating_sub(self.counters.len())
  }
}

// ─── Limiter ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  Owner,
  Global,
}

/// A rejected read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
  pub scope:       Scope,
  pub retry_after: Duration,
}

pub struct RateLimiter {
  counters:       std::sync::Arc<dyn CounterStore>,
  global_limit:   u64,
  owner_interval: Duration,
}

impl RateLimiter {
  pub fn new(
    counters: std::sync::Arc<dyn CounterStore>,
    global_limit: u64,
    owner_interval: Duration,
  ) -> Self {
    Self { counters, global_limit, owner_interval }
  }

  /// Admit or reject one degraded read by `owner_id`. The owner window is
  /// checked first, so a rejected owner never consumes global budget; a read
  /// the global ceiling rejects gives the owner its slot back.
  pub fn check(&self, owner_id: &str) -> Result<(), Throttled> {
    let owner_key = format!("degraded:owner:{owner_id}");
    let owner = self.counters.increment(&owner_key, self.owner_interval);
    if owner.count > 1 {
      return Err(Throttled {
        scope:       Scope::Owner,
        retry_after: owner.resets_in,
      });
    }

    let global = self.counters.increment(GLOBAL_KEY, GLOBAL_WINDOW);
    if global.count > self.global_limit {
      // This read opened the owner's window; it was never served.
      self.counters.expire(&owner_key);
      return Err(Throttled {
        scope:       Scope::Global,
        retry_after: global.resets_in,
      });
    }
    Ok(())
  }

  pub fn prune(&self) -> usize { self.counters.prune() }
}
