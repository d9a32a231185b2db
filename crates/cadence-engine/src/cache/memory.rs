//! In-process [`CacheIndex`] backed by a sharded concurrent map.

use std::{
  collections::{BTreeSet, HashMap},
  sync::atomic::{AtomicBool, AtomicU64, Ordering},
  time::Duration,
};

use async_trait::async_trait;
use cadence_core::review::{Classification, ClassificationFilter, DueItem};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CacheError, CacheIndex, CacheItem, CacheKey, CacheResult, PartitionStats};

// ─── Entry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Slot {
  due_at: DateTime<Utc>,
  tags:   Classification,
}

/// The score-ordered set for one (owner, partition).
#[derive(Debug)]
struct Entry {
  slots:   HashMap<String, Slot>,
  /// (due millis, item id), kept in lockstep with `slots`.
  order:   BTreeSet<(i64, String)>,
  warm:    bool,
  /// Milliseconds since the index epoch at the last read or write.
  touched: AtomicU64,
}

impl Entry {
  fn new(warm: bool, now: u64) -> Self {
    Self {
      slots: HashMap::new(),
      order: BTreeSet::new(),
      warm,
      touched: AtomicU64::new(now),
    }
  }

  fn set(&mut self, item: CacheItem) {
    let tags = match self.slots.get(&item.item_id) {
      Some(old) => {
        self.order.remove(&(old.due_at.timestamp_millis(), item.item_id.clone()));
        item.classification.or(&old.tags)
      }
      None => item.classification,
    };
    self
      .order
      .insert((item.due_at.timestamp_millis(), item.item_id.clone()));
    self.slots.insert(item.item_id, Slot { due_at: item.due_at, tags });
  }

  /// Insert only if the item isn't cached yet.
  fn fill(&mut self, item: CacheItem) -> bool {
    if self.slots.contains_key(&item.item_id) {
      return false;
    }
    self.set(item);
    true
  }

  fn remove(&mut self, item_id: &str) -> bool {
    match self.slots.remove(item_id) {
      Some(old) => {
        self.order.remove(&(old.due_at.timestamp_millis(), item_id.to_owned()));
        true
      }
      None => false,
    }
  }

  fn due(&self, now: DateTime<Utc>, limit: usize, filter: &ClassificationFilter) -> Vec<DueItem> {
    let now_ms = now.timestamp_millis();
    self
      .order
      .iter()
      .take_while(|(due, _)| *due <= now_ms)
      .filter_map(|(_, id)| self.slots.get(id).map(|slot| (id, slot)))
      .filter(|(_, slot)| filter.matches(&slot.tags))
      .take(limit)
      .map(|(id, slot)| DueItem {
        item_id:        id.clone(),
        next_review_at: slot.due_at,
        classification: slot.tags.clone(),
      })
      .collect()
  }
}

// ─── Index ───────────────────────────────────────────────────────────────────

/// A [`CacheIndex`] living in this process.
///
/// The map is sharded, so unrelated keys rarely contend; every operation on a
/// key holds that key's shard lock only for the duration of the operation.
#[derive(Debug)]
pub struct MemoryIndex {
  entries: DashMap<CacheKey, Entry>,
  epoch:   Instant,
  online:  AtomicBool,
}

impl Default for MemoryIndex {
  fn default() -> Self { Self::new() }
}

impl MemoryIndex {
  pub fn new() -> Self {
    Self {
      entries: DashMap::new(),
      epoch:   Instant::now(),
      online:  AtomicBool::new(true),
    }
  }

  /// Simulate losing (or regaining) the cache. While offline every operation
  /// fails with [`CacheError::Unavailable`].
  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Drop every entry, as if the cache had restarted.
  pub fn clear(&self) { self.entries.clear(); }

  fn now(&self) -> u64 { self.epoch.elapsed().as_millis() as u64 }

  fn ensure_online(&self) -> CacheResult<()> {
    if self.online.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(CacheError::Unavailable("in-memory index is offline".into()))
    }
  }
}

#[async_trait]
impl CacheIndex for MemoryIndex {
  async fn available(&self) -> bool { self.online.load(Ordering::SeqCst) }

  async fn upsert(&self, key: &CacheKey, item: CacheItem) -> CacheResult<()> {
    self.upsert_batch(key, std::slice::from_ref(&item)).await
  }

  async fn upsert_batch(&self, key: &CacheKey, items: &[CacheItem]) -> CacheResult<()> {
    self.ensure_online()?;
    let now = self.now();
    let mut entry = self
      .entries
      .entry(key.clone())
      .or_insert_with(|| Entry::new(false, now));
    for item in items {
      entry.set(item.clone());
    }
    entry.touched.store(now, Ordering::Relaxed);
    Ok(())
  }

  async fn due_items(
    &self,
    key:    &CacheKey,
    now:    DateTime<Utc>,
    limit:  usize,
    filter: &ClassificationFilter,
  ) -> CacheResult<Option<Vec<DueItem>>> {
    self.ensure_online()?;
    let Some(entry) = self.entries.get(key) else {
      return Ok(None);
    };
    if !entry.warm {
      return Ok(None);
    }
    entry.touched.store(self.now(), Ordering::Relaxed);
    Ok(Some(entry.due(now, limit, filter)))
  }

  async fn remove(&self, key: &CacheKey, item_id: &str) -> CacheResult<bool> {
    self.ensure_online()?;
    Ok(
      self
        .entries
        .get_mut(key)
        .map(|mut entry| entry.remove(item_id))
        .unwrap_or(false),
    )
  }

  async fn score(&self, key: &CacheKey, item_id: &str) -> CacheResult<Option<DateTime<Utc>>> {
    self.ensure_online()?;
    Ok(
      self
        .entries
        .get(key)
        .and_then(|entry| entry.slots.get(item_id).map(|slot| slot.due_at)),
    )
  }

  async fn hydrate(&self, key: &CacheKey, items: Vec<CacheItem>) -> CacheResult<usize> {
    self.ensure_online()?;
    let now = self.now();
    let mut entry = self
      .entries
      .entry(key.clone())
      .or_insert_with(|| Entry::new(false, now));
    let added = items.into_iter().filter(|item| entry.fill(item.clone())).count();
    entry.warm = true;
    entry.touched.store(now, Ordering::Relaxed);
    Ok(added)
  }

  async fn replace(
    &self,
    key:      &CacheKey,
    items:    Vec<CacheItem>,
    preserve: &[String],
  ) -> CacheResult<usize> {
    self.ensure_online()?;
    let now = self.now();
    let mut fresh = Entry::new(true, now);
    for item in items {
      fresh.set(item);
    }

    let mut entry = self
      .entries
      .entry(key.clone())
      .or_insert_with(|| Entry::new(true, now));
    for item_id in preserve {
      if let Some(slot) = entry.slots.get(item_id) {
        fresh.set(CacheItem {
          item_id:        item_id.clone(),
          due_at:         slot.due_at,
          classification: slot.tags.clone(),
        });
      }
    }
    let size = fresh.slots.len();
    *entry = fresh;
    Ok(size)
  }

  async fn purge_partition(&self, partition_key: &str, batch_size: usize) -> CacheResult<u64> {
    let batch_size = batch_size.max(1);
    let mut purged = 0;
    loop {
      self.ensure_online()?;
      let batch: Vec<CacheKey> = self
        .entries
        .iter()
        .filter(|e| e.key().partition_key == partition_key)
        .take(batch_size)
        .map(|e| e.key().clone())
        .collect();
      if batch.is_empty() {
        break;
      }
      for key in &batch {
        if self.entries.remove(key).is_some() {
          purged += 1;
        }
      }
      tokio::task::yield_now().await;
    }
    Ok(purged)
  }

  async fn evict_idle(&self, idle_for: Duration) -> CacheResult<u64> {
    self.ensure_online()?;
    let now = self.now();
    let idle_ms = idle_for.as_millis() as u64;
    let before = self.entries.len();
    self
      .entries
      .retain(|_, entry| now.saturating_sub(entry.touched.load(Ordering::Relaxed)) < idle_ms);
    Ok(before.saturating_sub(self.entries.len()) as u64)
  }

  async fn stats(&self, partition_key: &str) -> CacheResult<PartitionStats> {
    self.ensure_online()?;
    Ok(
      self
        .entries
        .iter()
        .filter(|e| e.key().partition_key == partition_key)
        .fold(PartitionStats::default(), |mut acc, e| {
          acc.keys += 1;
          acc.warm_keys += usize::from(e.warm);
          acc.items += e.slots.len();
          acc
        }),
    )
  }
}
