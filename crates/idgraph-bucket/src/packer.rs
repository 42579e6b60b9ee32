//! Storage packer: shards items into [`NUM_BUCKETS`] buckets under a prefix.

use std::sync::Arc;

use idgraph_config::{log_packer_debug, log_packer_warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::view::StorageView;
use crate::{bucket_index, compute_hash, hash_to_hex, BucketError, Result, NUM_BUCKETS};

/// One packed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// ID of the record (entity or group ID)
    pub id: String,
    /// Encoded record
    pub message: Vec<u8>,
}

/// The set of items currently hashed to one storage key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: String,
    pub items: Vec<Item>,
}

impl Bucket {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            items: Vec::new(),
        }
    }

    /// Replace the item with the same ID, or append it.
    pub fn upsert(&mut self, item: Item) {
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    /// Remove an item, returning whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        self.items.len() != before
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.id == id)
    }
}

/// Packs items into hashed buckets stored under `prefix` in a view.
///
/// Read-modify-write of a bucket is serialized per bucket, so concurrent
/// writes of co-resident items never lose each other.
pub struct StoragePacker {
    view: Arc<dyn StorageView>,
    prefix: String,
    bucket_locks: Vec<Mutex<()>>,
}

impl StoragePacker {
    /// `prefix` must end with `/` (e.g. `packer/buckets/`).
    pub fn new(view: Arc<dyn StorageView>, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || !prefix.ends_with('/') {
            return Err(BucketError::InvalidKey { key: prefix });
        }
        Ok(Self {
            view,
            prefix,
            bucket_locks: (0..NUM_BUCKETS).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Underlying storage view
    pub fn view(&self) -> &dyn StorageView {
        self.view.as_ref()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage key of the bucket holding `item_id`
    pub fn bucket_key(&self, item_id: &str) -> String {
        format!("{}{}", self.prefix, bucket_index(item_id))
    }

    /// Hash identifying the bucket of a storage key.
    ///
    /// Records cache this value so an invalidated key can be mapped back
    /// to the records it holds.
    pub fn bucket_key_hash_by_key(key: &str) -> String {
        hash_to_hex(&compute_hash(key.as_bytes()))
    }

    /// Hash identifying the bucket of `item_id`
    pub fn bucket_key_hash_by_item_id(&self, item_id: &str) -> String {
        Self::bucket_key_hash_by_key(&self.bucket_key(item_id))
    }

    /// Whether a storage key belongs to this packer
    pub fn owns_key(&self, key: &str) -> bool {
        key.strip_prefix(&self.prefix)
            .and_then(|rest| rest.parse::<usize>().ok())
            .is_some_and(|idx| idx < NUM_BUCKETS)
    }

    /// Every bucket key that currently exists under the prefix
    pub fn bucket_keys(&self) -> Result<Vec<String>> {
        let mut keys = self.view.list(&self.prefix)?;
        keys.retain(|k| self.owns_key(k));
        Ok(keys)
    }

    /// Read and decode a bucket. A bucket that was never written is `None`.
    #[instrument(skip(self), level = "debug")]
    pub fn get_bucket(&self, key: &str) -> Result<Option<Bucket>> {
        let Some(raw) = self.view.get(key)? else {
            return Ok(None);
        };
        let bucket: Bucket = bincode::deserialize(&raw).map_err(|e| BucketError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if bucket.key != key {
            return Err(BucketError::Corrupted {
                key: key.to_string(),
                reason: format!("bucket claims key {}", bucket.key),
            });
        }
        Ok(Some(bucket))
    }

    fn put_bucket(&self, bucket: &Bucket) -> Result<()> {
        let raw = bincode::serialize(bucket)?;
        self.view.put(&bucket.key, &raw)
    }

    /// Insert or replace an item in its bucket.
    #[instrument(skip(self, item), fields(item_id = %item.id), level = "debug")]
    pub fn put_item(&self, item: Item) -> Result<()> {
        if item.id.is_empty() {
            return Err(BucketError::MissingItemId);
        }
        let idx = bucket_index(&item.id);
        let key = format!("{}{}", self.prefix, idx);

        let _guard = self.bucket_locks[idx].lock();
        let mut bucket = self.get_bucket(&key)?.unwrap_or_else(|| Bucket::new(key.as_str()));
        bucket.upsert(item);
        self.put_bucket(&bucket)?;

        log_packer_debug!("Item stored", key = key.as_str(), items = bucket.items.len());
        Ok(())
    }

    /// Fetch a single item by ID.
    pub fn get_item(&self, item_id: &str) -> Result<Option<Item>> {
        if item_id.is_empty() {
            return Err(BucketError::MissingItemId);
        }
        let key = self.bucket_key(item_id);
        Ok(self
            .get_bucket(&key)?
            .and_then(|b| b.items.into_iter().find(|i| i.id == item_id)))
    }

    /// Remove an item from its bucket. Removing a missing item is a no-op.
    ///
    /// An emptied bucket is written back as an empty bucket rather than
    /// deleted; readers treat both the same.
    #[instrument(skip(self), level = "debug")]
    pub fn delete_item(&self, item_id: &str) -> Result<()> {
        if item_id.is_empty() {
            return Err(BucketError::MissingItemId);
        }
        let idx = bucket_index(item_id);
        let key = format!("{}{}", self.prefix, idx);

        let _guard = self.bucket_locks[idx].lock();
        let Some(mut bucket) = self.get_bucket(&key)? else {
            return Ok(());
        };
        if !bucket.remove(item_id) {
            log_packer_warn!("Delete of absent item", key = key.as_str(), item_id = item_id);
            return Ok(());
        }
        self.put_bucket(&bucket)
    }
}
