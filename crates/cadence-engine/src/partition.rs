//! Partition lifecycle: provisioning physical storage and guarding flag
//! changes.

use std::{
  collections::HashSet,
  sync::{Arc, RwLock},
};

use cadence_core::{
  partition::{NewPartition, PartitionEntity, PartitionFlags, Provisioned},
  store::ReviewStore,
};

use crate::{
  error::{store_err, Error},
  Result,
};

pub struct PartitionManager<S> {
  store:    Arc<S>,
  /// Keys known to be provisioned, to skip the store round trip.
  ensured:  RwLock<HashSet<String>>,
  /// Keys known to be archived. Archival is permanent, so this only grows.
  archived: RwLock<HashSet<String>>,
}

impl<S: ReviewStore> PartitionManager<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      ensured: RwLock::new(HashSet::new()),
      archived: RwLock::new(HashSet::new()),
    }
  }

  /// Whether `partition_key` has been archived.
  pub async fn is_archived(&self, partition_key: &str) -> Result<bool> {
    let known = self
      .archived
      .read()
      .map(|set| set.contains(partition_key))
      .unwrap_or(false);
    if known {
      return Ok(true);
    }
    let archived = self
      .store
      .is_partition_archived(partition_key)
      .await
      .map_err(store_err)?;
    if archived && let Ok(mut set) = self.archived.write() {
      set.insert(partition_key.to_owned());
    }
    Ok(archived)
  }

  fn known(&self, partition_key: &str) -> bool {
    self
      .ensured
      .read()
      .map(|set| set.contains(partition_key))
      .unwrap_or(false)
  }

  fn remember(&self, partition_key: &str) {
    if let Ok(mut set) = self.ensured.write() {
      set.insert(partition_key.to_owned());
    }
  }

  fn forget(&self, partition_key: &str) {
    if let Ok(mut set) = self.ensured.write() {
      set.remove(partition_key);
    }
  }

  /// Make sure physical storage exists for `partition_key` and that its
  /// entity, if any, records it. Safe to call concurrently and repeatedly; a
  /// lost provisioning race counts as success.
  pub async fn ensure_partition(&self, partition_key: &str) -> Result<()> {
    if partition_key.is_empty() {
      return Err(cadence_core::Error::EmptyPartitionKey.into());
    }
    if self.known(partition_key) {
      return Ok(());
    }

    let exists = self
      .store
      .storage_partition_exists(partition_key)
      .await
      .map_err(store_err)?;
    if !exists {
      match self
        .store
        .provision_storage_partition(partition_key)
        .await
        .map_err(store_err)?
      {
        Provisioned::Created => {
          tracing::info!(%partition_key, "storage partition provisioned");
        }
        Provisioned::AlreadyExisted => {
          tracing::debug!(%partition_key, "storage partition provisioned concurrently");
        }
      }
    }

    if self
      .store
      .mark_partition_created(partition_key)
      .await
      .map_err(store_err)?
    {
      tracing::info!(%partition_key, "partition marked created");
    }
    self.remember(partition_key);
    Ok(())
  }

  /// Create a partition entity and run the lifecycle hook for it.
  ///
  /// Creating a partition that is both active and set to auto-archive needs
  /// `confirm`: it would be archived as soon as it is deactivated.
  pub async fn create_partition(
    &self,
    input: NewPartition,
    confirm: bool,
  ) -> Result<PartitionEntity> {
    if input.partition_key.is_empty() {
      return Err(cadence_core::Error::EmptyPartitionKey.into());
    }
    if input.is_active && input.auto_archive_enabled && !confirm {
      return Err(Error::ActivePartition(input.partition_key));
    }

    let key = input.partition_key.clone();
    let Some(entity) = self
      .store
      .create_partition(input)
      .await
      .map_err(store_err)?
    else {
      return Err(Error::PartitionExists(key));
    };
    tracing::info!(partition_key = %key, "partition entity created");

    // The key may have been provisioned before its entity existed.
    self.forget(&key);
    self.ensure_partition(&key).await?;
    // Re-read so the caller sees `partition_created`.
    Ok(self.get(&key).await?.unwrap_or(entity))
  }

  /// Apply `flags`. Turning on auto-archive for a partition that is (or
  /// stays) active needs `confirm`.
  pub async fn update_flags(
    &self,
    partition_key: &str,
    flags: PartitionFlags,
    confirm: bool,
  ) -> Result<PartitionEntity> {
    let current = self
      .get(partition_key)
      .await?
      .ok_or_else(|| Error::PartitionNotFound(partition_key.to_owned()))?;

    let next = flags.apply(&current);
    let newly_live_auto = next.is_active
      && next.auto_archive_enabled
      && !(current.is_active && current.auto_archive_enabled);
    if newly_live_auto && !confirm {
      return Err(Error::ActivePartition(partition_key.to_owned()));
    }

    let updated = self
      .store
      .update_partition(partition_key, flags)
      .await
      .map_err(store_err)?
      .ok_or_else(|| Error::PartitionNotFound(partition_key.to_owned()))?;
    tracing::info!(
      %partition_key,
      is_active = updated.is_active,
      caching_enabled = updated.caching_enabled,
      auto_archive_enabled = updated.auto_archive_enabled,
      "partition flags updated"
    );
    Ok(updated)
  }

  pub async fn get(&self, partition_key: &str) -> Result<Option<PartitionEntity>> {
    self
      .store
      .get_partition(partition_key)
      .await
      .map_err(store_err)
  }

  pub async fn list(&self) -> Result<Vec<PartitionEntity>> {
    self.store.list_partitions().await.map_err(store_err)
  }

  /// Whether reads for `partition_key` may populate the cache. Partitions
  /// without an entity are cached.
  pub async fn caching_enabled(&self, partition_key: &str) -> Result<bool> {
    Ok(
      self
        .get(partition_key)
        .await?
        .map(|e| e.caching_enabled)
        .unwrap_or(true),
    )
  }
}
