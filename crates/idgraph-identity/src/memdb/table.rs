//! Persistent-map table with unique and multi-valued secondary indexes.

use std::sync::Arc;

use im::{OrdMap, OrdSet};

use super::{MemDbError, Result};

/// Secondary index declaration
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub unique: bool,
}

/// A row type stored in a [`Table`].
pub trait Record: Clone + Send + Sync + 'static {
    /// Secondary indexes, in a fixed order
    const INDEXES: &'static [IndexDef];

    /// Primary key
    fn id(&self) -> &str;

    /// Keys this record contributes to `index`. Empty means the record is
    /// not present in that index.
    fn index_keys(&self, index: &str) -> Vec<String>;
}

/// Join the parts of a compound index key.
pub fn compound_key(parts: &[&str]) -> String {
    parts.join("\u{0}")
}

type IndexMap = OrdMap<String, OrdSet<String>>;

/// One table of the cache.
///
/// Cloning is O(1); clones share structure until one of them is written.
#[derive(Debug, Clone)]
pub struct Table<T: Record> {
    name: &'static str,
    rows: OrdMap<String, Arc<T>>,
    indexes: Vec<IndexMap>,
}

impl<T: Record> Table<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: OrdMap::new(),
            indexes: T::INDEXES.iter().map(|_| OrdMap::new()).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn position(&self, index: &str) -> Result<usize> {
        T::INDEXES
            .iter()
            .position(|def| def.name == index)
            .ok_or_else(|| MemDbError::UnknownIndex {
                table: self.name,
                index: index.to_string(),
            })
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.rows.get(id).cloned()
    }

    /// First record (by ID order) under `key` in `index`
    pub fn first(&self, index: &str, key: &str) -> Result<Option<Arc<T>>> {
        let pos = self.position(index)?;
        Ok(self.indexes[pos]
            .get(key)
            .and_then(|ids| ids.iter().next())
            .and_then(|id| self.get(id)))
    }

    /// Every record under `key` in `index`, ordered by ID
    pub fn get_all(&self, index: &str, key: &str) -> Result<Vec<Arc<T>>> {
        let pos = self.position(index)?;
        Ok(self.indexes[pos]
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default())
    }

    /// All records, ordered by ID
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> + '_ {
        self.rows.values()
    }

    /// Insert or replace a record.
    ///
    /// A replaced record is fully removed from every index before the new
    /// one is added. Unique indexes are checked first so a rejected insert
    /// leaves the table untouched.
    pub fn insert(&mut self, record: T) -> Result<Arc<T>> {
        let id = record.id().to_string();
        if id.is_empty() {
            return Err(MemDbError::MissingId { table: self.name });
        }

        for (pos, def) in T::INDEXES.iter().enumerate() {
            if !def.unique {
                continue;
            }
            for key in record.index_keys(def.name) {
                let taken = self.indexes[pos]
                    .get(&key)
                    .is_some_and(|ids| ids.iter().any(|other| *other != id));
                if taken {
                    return Err(MemDbError::UniqueViolation {
                        table: self.name,
                        index: def.name,
                        key,
                    });
                }
            }
        }

        self.delete(&id);

        let record = Arc::new(record);
        for (pos, def) in T::INDEXES.iter().enumerate() {
            for key in record.index_keys(def.name) {
                let mut ids = self.indexes[pos].get(&key).cloned().unwrap_or_default();
                ids.insert(id.clone());
                self.indexes[pos].insert(key, ids);
            }
        }
        self.rows.insert(id, record.clone());
        Ok(record)
    }

    /// Remove a record and its index entries
    pub fn delete(&mut self, id: &str) -> Option<Arc<T>> {
        let old = self.rows.remove(id)?;
        for (pos, def) in T::INDEXES.iter().enumerate() {
            for key in old.index_keys(def.name) {
                let Some(ids) = self.indexes[pos].get(&key) else {
                    continue;
                };
                let mut ids = ids.clone();
                ids.remove(id);
                if ids.is_empty() {
                    self.indexes[pos].remove(&key);
                } else {
                    self.indexes[pos].insert(key, ids);
                }
            }
        }
        Some(old)
    }
}
