//! Byte-oriented storage views.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{BucketError, Result};

/// Durable key/value service the packer writes through.
///
/// A missing key is `Ok(None)` from [`get`](StorageView::get), never an
/// error. Deleting a missing key succeeds.
pub trait StorageView: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`.
    fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

impl<T: StorageView + ?Sized> StorageView for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }
}

/// Reject keys that could escape a view's namespace.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(BucketError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// In-memory storage view
#[derive(Debug, Default)]
pub struct MemoryView {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StorageView for MemoryView {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Scopes an inner view under a fixed sub-path.
///
/// Keys passed in are relative to the sub-path; keys returned by
/// [`list`](StorageView::list) are relative as well.
#[derive(Clone)]
pub struct PrefixView {
    inner: Arc<dyn StorageView>,
    prefix: String,
}

impl PrefixView {
    /// `prefix` must end with `/`.
    pub fn new(inner: Arc<dyn StorageView>, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if !prefix.ends_with('/') {
            return Err(BucketError::InvalidKey { key: prefix });
        }
        validate_key(prefix.trim_end_matches('/'))?;
        Ok(Self { inner, prefix })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl StorageView for PrefixView {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.full_key(key))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.put(&self.full_key(key), value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.full_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.inner.list(&self.full_key(prefix))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}
