//! Items written to the cache whose persistence job hasn't finished yet.
//!
//! While an item is pending the cache is ahead of the durable store on
//! purpose, so reconciliation leaves it alone and a rebuild keeps its cached
//! score.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::cache::CacheKey;

#[derive(Debug, Default)]
pub struct PendingWrites {
  /// Count of in-flight jobs per (key, item).
  items: DashMap<(CacheKey, String), usize>,
}

impl PendingWrites {
  pub fn new() -> Self { Self::default() }

  pub fn begin<'a>(&self, key: &CacheKey, item_ids: impl IntoIterator<Item = &'a str>) {
    for item_id in item_ids {
      *self
        .items
        .entry((key.clone(), item_id.to_owned()))
        .or_insert(0) += 1;
    }
  }

  pub fn finish<'a>(&self, key: &CacheKey, item_ids: impl IntoIterator<Item = &'a str>) {
    for item_id in item_ids {
      self
        .items
        .remove_if_mut(&(key.clone(), item_id.to_owned()), |_, n| {
          *n = n.saturating_sub(1);
          *n == 0
        });
    }
  }

  pub fn is_pending(&self, key: &CacheKey, item_id: &str) -> bool {
    self.items.contains_key(&(key.clone(), item_id.to_owned()))
  }

  pub fn items_for(&self, key: &CacheKey) -> Vec<String> {
    self
      .items
      .iter()
      .filter(|e| &e.key().0 == key)
      .map(|e| e.key().1.clone())
      .collect::<HashSet<_>>()
      .into_iter()
      .collect()
  }

  pub fn len(&self) -> usize { self.items.len() }

  pub fn is_empty(&self) -> bool { self.items.is_empty() }
}
