//! Startup load and bucket invalidation.
//!
//! # Load pipeline
//!
//! ```text
//! bucket keys → work queue → N fetch workers → result queue → caller thread
//!  (broker)     (bounded)    (get_bucket)       (bounded)     (1 txn / record)
//! ```
//!
//! Fetching is parallel; cache insertion stays on the calling thread so
//! records are applied one transaction at a time in arrival order. The
//! load trusts storage and persists nothing.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use idgraph_bucket::{Bucket, StoragePacker};
use idgraph_config::{log_loader_debug, log_loader_info};

use crate::error::Result;
use crate::types::{Entity, Group};
use crate::IdentityStore;

/// Counters from one [`IdentityStore::load`]
#[derive(Debug, Default, Clone)]
pub struct LoadStats {
    pub entity_buckets: usize,
    pub entities: usize,
    pub group_buckets: usize,
    pub groups: usize,
    pub duration: Duration,
}

/// Fetch every bucket under `packer` with up to `workers` concurrent
/// reads, handing each decoded bucket to `apply` on the calling thread.
///
/// Stops at the first error; in-flight fetches are abandoned.
fn fetch_buckets(
    packer: &StoragePacker,
    workers: usize,
    mut apply: impl FnMut(Bucket) -> Result<()>,
) -> Result<usize> {
    let keys = packer.bucket_keys()?;
    if keys.is_empty() {
        return Ok(0);
    }
    let workers = workers.clamp(1, keys.len());

    let (work_tx, work_rx) = bounded::<String>(workers);
    let (result_tx, result_rx) = bounded::<idgraph_bucket::Result<Option<Bucket>>>(workers);

    thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for key in work_rx.iter() {
                    if result_tx.send(packer.get_bucket(&key)).is_err() {
                        break;
                    }
                }
            });
        }
        scope.spawn(move || {
            for key in keys {
                if work_tx.send(key).is_err() {
                    break;
                }
            }
        });
        drop(work_rx);
        drop(result_tx);
        drain(result_rx, &mut apply)
    })
}

/// Apply results until the queue closes or one fails. Returning drops the
/// receiver, which unblocks any worker still sending.
fn drain(
    results: Receiver<idgraph_bucket::Result<Option<Bucket>>>,
    apply: &mut impl FnMut(Bucket) -> Result<()>,
) -> Result<usize> {
    let mut fetched = 0;
    for result in results.iter() {
        let Some(bucket) = result? else {
            continue;
        };
        fetched += 1;
        apply(bucket)?;
    }
    Ok(fetched)
}

impl IdentityStore {
    /// Populate the cache from every persisted entity and group bucket.
    pub fn load(&self) -> Result<LoadStats> {
        let start = Instant::now();
        let workers = self.config.load_workers;
        let mut stats = LoadStats::default();

        log_loader_info!("Loading entities", workers = workers);
        stats.entity_buckets = fetch_buckets(&self.entity_packer, workers, |bucket| {
            for item in bucket.items {
                let entity: Entity = bincode::deserialize(&item.message)?;
                let mut txn = self.db.write();
                self.upsert_entity_in_txn(&mut txn, entity, false)?;
                txn.commit();
                stats.entities += 1;
            }
            Ok(())
        })?;

        log_loader_info!("Loading groups", workers = workers);
        stats.group_buckets = fetch_buckets(&self.group_packer, workers, |bucket| {
            for item in bucket.items {
                let group: Group = bincode::deserialize(&item.message)?;
                let mut txn = self.db.write();
                self.upsert_group_in_txn(&mut txn, group, false)?;
                txn.commit();
                stats.groups += 1;
            }
            Ok(())
        })?;

        stats.duration = start.elapsed();
        log_loader_info!(
            "Identity load finished",
            entities = stats.entities,
            groups = stats.groups,
            duration_ms = stats.duration.as_millis() as u64
        );
        Ok(stats)
    }

    /// Resync the cache with a changed storage key.
    ///
    /// Every cached record of the bucket is dropped and whatever the bucket
    /// now holds is re-inserted, so updates, inserts and deletes inside the
    /// bucket are all reconciled. Keys outside both packers are ignored.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        if self.entity_packer.owns_key(key) {
            self.invalidate_entity_bucket(key)
        } else if self.group_packer.owns_key(key) {
            self.invalidate_group_bucket(key)
        } else {
            log_loader_debug!("Ignoring invalidation of foreign key", key = key);
            Ok(())
        }
    }

    fn invalidate_entity_bucket(&self, key: &str) -> Result<()> {
        let hash = StoragePacker::bucket_key_hash_by_key(key);
        let bucket = self.entity_packer.get_bucket(key)?;
        let mut txn = self.db.write();

        let cached = txn.entities_by_bucket_key_hash(&hash)?;
        for entity in &cached {
            txn.delete_entity(&entity.id);
        }
        let mut restored = 0;
        for item in bucket.map(|b| b.items).unwrap_or_default() {
            let entity: Entity = bincode::deserialize(&item.message)?;
            self.upsert_entity_in_txn(&mut txn, entity, false)?;
            restored += 1;
        }
        txn.commit();

        log_loader_debug!(
            "Entity bucket resynced",
            key = key,
            dropped = cached.len(),
            restored = restored
        );
        Ok(())
    }

    fn invalidate_group_bucket(&self, key: &str) -> Result<()> {
        let hash = StoragePacker::bucket_key_hash_by_key(key);
        let _groups = self.group_lock.write();
        let bucket = self.group_packer.get_bucket(key)?;
        let mut txn = self.db.write();

        let cached = txn.groups_by_bucket_key_hash(&hash)?;
        for group in &cached {
            txn.delete_group(&group.id);
        }
        let mut restored = 0;
        for item in bucket.map(|b| b.items).unwrap_or_default() {
            let group: Group = bincode::deserialize(&item.message)?;
            self.upsert_group_in_txn(&mut txn, group, false)?;
            restored += 1;
        }
        txn.commit();

        log_loader_debug!(
            "Group bucket resynced",
            key = key,
            dropped = cached.len(),
            restored = restored
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRequest;
    use crate::test_support::store;

    #[test]
    fn test_load_empty_store() {
        let store = store();
        let stats = store.load().unwrap();
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.entity_buckets, 0);
    }

    #[test]
    fn test_foreign_key_invalidation_is_ignored() {
        let store = store();
        store.invalidate("sys/policy/default").unwrap();
        store.invalidate("packer/buckets/999").unwrap();
    }

    #[test]
    fn test_invalidate_drops_deleted_records() {
        let store = store();
        let entity = store.register_entity(EntityRequest::default()).unwrap();
        let key = store.entity_packer.bucket_key(&entity.id);

        // Remove it behind the cache's back
        store.entity_packer.delete_item(&entity.id).unwrap();
        assert!(store.read_entity(&entity.id).unwrap().is_some());

        store.invalidate(&key).unwrap();
        assert!(store.read_entity(&entity.id).unwrap().is_none());
    }
}
