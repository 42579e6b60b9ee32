//! Entity lock shards.

use idgraph_bucket::{bucket_index, NUM_BUCKETS};
use parking_lot::{Mutex, MutexGuard};

/// Fixed array of mutexes; an entity ID maps to one shard.
pub struct LockShards {
    shards: Vec<Mutex<()>>,
}

impl Default for LockShards {
    fn default() -> Self {
        Self::new()
    }
}

impl LockShards {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_BUCKETS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_index(&self, id: &str) -> usize {
        bucket_index(id) % self.shards.len()
    }

    pub fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(id)].lock()
    }

    /// Lock the shards of two IDs in index order. The second guard is
    /// `None` when both IDs share a shard.
    pub fn lock_pair(&self, a: &str, b: &str) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (ia, ib) = (self.shard_index(a), self.shard_index(b));
        if ia == ib {
            return (self.shards[ia].lock(), None);
        }
        let (lo, hi) = if ia < ib { (ia, ib) } else { (ib, ia) };
        let first = self.shards[lo].lock();
        let second = self.shards[hi].lock();
        (first, Some(second))
    }

    /// Lock every distinct shard touched by `ids`, lowest index first.
    pub fn lock_many<S: AsRef<str>>(&self, ids: &[S]) -> Vec<MutexGuard<'_, ()>> {
        let mut indexes: Vec<usize> = ids.iter().map(|id| self.shard_index(id.as_ref())).collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes.into_iter().map(|i| self.shards[i].lock()).collect()
    }
}
