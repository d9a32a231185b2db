//! Cache liveness probes.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use async_trait::async_trait;

use crate::cache::CacheIndex;

/// Answers "is the cache reachable right now?".
#[async_trait]
pub trait HealthCheck: Send + Sync {
  async fn probe(&self) -> bool;
}

/// Probes a [`CacheIndex`] directly.
pub struct IndexHealth {
  index: Arc<dyn CacheIndex>,
}

impl IndexHealth {
  pub fn new(index: Arc<dyn CacheIndex>) -> Self { Self { index } }
}

#[async_trait]
impl HealthCheck for IndexHealth {
  async fn probe(&self) -> bool { self.index.available().await }
}

/// A switch, for forcing degraded mode on or off.
#[derive(Debug)]
pub struct StaticHealth {
  up: AtomicBool,
}

impl StaticHealth {
  pub fn up() -> Self { Self { up: AtomicBool::new(true) } }

  pub fn down() -> Self { Self { up: AtomicBool::new(false) } }

  pub fn set(&self, up: bool) { self.up.store(up, Ordering::SeqCst); }
}

#[async_trait]
impl HealthCheck for StaticHealth {
  async fn probe(&self) -> bool { self.up.load(Ordering::SeqCst) }
}
