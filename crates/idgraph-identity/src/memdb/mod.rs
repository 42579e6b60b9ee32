//! Transactional in-memory index over identity records.
//!
//! The committed state is an immutable [`Tables`] snapshot behind an
//! [`ArcSwap`]. Readers load the current snapshot and never block. A
//! writer takes the single write lock, mutates a private clone (cheap,
//! since every table is a persistent map) and publishes it on commit.
//! Dropping a [`WriteTxn`] without committing discards every change it
//! made, including partial index updates.
//!
//! Lookups return shared `Arc` handles to the indexed records. Callers
//! that intend to modify a record clone the inner value and upsert it
//! back through a write transaction.

mod table;

pub use table::{compound_key, IndexDef, Record, Table};

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::types::{Alias, Entity, Group};

/// Errors raised by the cache layer
#[derive(Error, Debug)]
pub enum MemDbError {
    #[error("unknown index {index:?} on table {table}")]
    UnknownIndex { table: &'static str, index: String },

    #[error("unique constraint on {table}.{index} violated by key {key:?}")]
    UniqueViolation {
        table: &'static str,
        index: &'static str,
        key: String,
    },

    #[error("record without an ID inserted into {table}")]
    MissingId { table: &'static str },
}

pub type Result<T> = std::result::Result<T, MemDbError>;

pub const ENTITIES_TABLE: &str = "entities";
pub const ENTITY_ALIASES_TABLE: &str = "entity_aliases";
pub const GROUP_ALIASES_TABLE: &str = "group_aliases";
pub const GROUPS_TABLE: &str = "groups";

fn non_empty(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value.to_string()]
    }
}

fn metadata_keys(metadata: &crate::types::Metadata) -> Vec<String> {
    metadata
        .iter()
        .map(|(k, v)| compound_key(&[k.as_str(), v.as_str()]))
        .collect()
}

impl Record for Entity {
    const INDEXES: &'static [IndexDef] = &[
        IndexDef { name: "name", unique: true },
        IndexDef { name: "metadata", unique: false },
        IndexDef { name: "bucket_key_hash", unique: false },
        IndexDef { name: "merged_entity_ids", unique: true },
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self, index: &str) -> Vec<String> {
        match index {
            "name" => non_empty(&self.name),
            "metadata" => metadata_keys(&self.metadata),
            "bucket_key_hash" => non_empty(&self.bucket_key_hash),
            "merged_entity_ids" => self.merged_entity_ids.clone(),
            _ => Vec::new(),
        }
    }
}

impl Record for Alias {
    const INDEXES: &'static [IndexDef] = &[
        IndexDef { name: "canonical_id", unique: false },
        IndexDef { name: "factors", unique: true },
        IndexDef { name: "metadata", unique: false },
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self, index: &str) -> Vec<String> {
        match index {
            "canonical_id" => non_empty(&self.canonical_id),
            "factors" => vec![compound_key(&[self.mount_accessor.as_str(), self.name.as_str()])],
            "metadata" => metadata_keys(&self.metadata),
            _ => Vec::new(),
        }
    }
}

impl Record for Group {
    const INDEXES: &'static [IndexDef] = &[
        IndexDef { name: "name", unique: true },
        IndexDef { name: "policies", unique: false },
        IndexDef { name: "parent_group_ids", unique: false },
        IndexDef { name: "member_entity_ids", unique: false },
        IndexDef { name: "bucket_key_hash", unique: false },
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self, index: &str) -> Vec<String> {
        match index {
            "name" => non_empty(&self.name),
            "policies" => self.policies.clone(),
            "parent_group_ids" => self.parent_group_ids.clone(),
            "member_entity_ids" => self.member_entity_ids.clone(),
            "bucket_key_hash" => non_empty(&self.bucket_key_hash),
            _ => Vec::new(),
        }
    }
}

/// The full table set
#[derive(Debug, Clone)]
pub struct Tables {
    entities: Table<Entity>,
    entity_aliases: Table<Alias>,
    group_aliases: Table<Alias>,
    groups: Table<Group>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            entities: Table::new(ENTITIES_TABLE),
            entity_aliases: Table::new(ENTITY_ALIASES_TABLE),
            group_aliases: Table::new(GROUP_ALIASES_TABLE),
            groups: Table::new(GROUPS_TABLE),
        }
    }
}

impl Tables {
    // Entities

    pub fn entity_by_id(&self, id: &str) -> Option<Arc<Entity>> {
        self.entities.get(id)
    }

    pub fn entity_by_name(&self, name: &str) -> Result<Option<Arc<Entity>>> {
        self.entities.first("name", name)
    }

    pub fn entities_by_metadata(&self, key: &str, value: &str) -> Result<Vec<Arc<Entity>>> {
        self.entities.get_all("metadata", &compound_key(&[key, value]))
    }

    pub fn entities_by_bucket_key_hash(&self, hash: &str) -> Result<Vec<Arc<Entity>>> {
        self.entities.get_all("bucket_key_hash", hash)
    }

    /// The entity that absorbed `merged_id` in a merge
    pub fn entity_by_merged_entity_id(&self, merged_id: &str) -> Result<Option<Arc<Entity>>> {
        self.entities.first("merged_entity_ids", merged_id)
    }

    /// Owner of an entity alias
    pub fn entity_by_alias_id(&self, alias_id: &str) -> Option<Arc<Entity>> {
        self.entity_aliases
            .get(alias_id)
            .and_then(|alias| self.entity_by_id(&alias.canonical_id))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<Entity>> + '_ {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // Entity aliases

    pub fn entity_alias_by_id(&self, id: &str) -> Option<Arc<Alias>> {
        self.entity_aliases.get(id)
    }

    pub fn entity_alias_by_factors(
        &self,
        mount_accessor: &str,
        name: &str,
    ) -> Result<Option<Arc<Alias>>> {
        self.entity_aliases
            .first("factors", &compound_key(&[mount_accessor, name]))
    }

    pub fn entity_aliases_by_canonical_id(&self, entity_id: &str) -> Result<Vec<Arc<Alias>>> {
        self.entity_aliases.get_all("canonical_id", entity_id)
    }

    pub fn entity_aliases_by_metadata(&self, key: &str, value: &str) -> Result<Vec<Arc<Alias>>> {
        self.entity_aliases
            .get_all("metadata", &compound_key(&[key, value]))
    }

    pub fn entity_aliases(&self) -> impl Iterator<Item = &Arc<Alias>> + '_ {
        self.entity_aliases.iter()
    }

    // Group aliases

    pub fn group_alias_by_id(&self, id: &str) -> Option<Arc<Alias>> {
        self.group_aliases.get(id)
    }

    pub fn group_alias_by_factors(
        &self,
        mount_accessor: &str,
        name: &str,
    ) -> Result<Option<Arc<Alias>>> {
        self.group_aliases
            .first("factors", &compound_key(&[mount_accessor, name]))
    }

    pub fn group_alias_by_canonical_id(&self, group_id: &str) -> Result<Option<Arc<Alias>>> {
        self.group_aliases.first("canonical_id", group_id)
    }

    pub fn group_aliases(&self) -> impl Iterator<Item = &Arc<Alias>> + '_ {
        self.group_aliases.iter()
    }

    // Groups

    pub fn group_by_id(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.get(id)
    }

    pub fn group_by_name(&self, name: &str) -> Result<Option<Arc<Group>>> {
        self.groups.first("name", name)
    }

    pub fn groups_by_policy(&self, policy: &str) -> Result<Vec<Arc<Group>>> {
        self.groups.get_all("policies", policy)
    }

    /// Groups listing `parent_id` as a parent, i.e. its member groups
    pub fn groups_by_parent_group_id(&self, parent_id: &str) -> Result<Vec<Arc<Group>>> {
        self.groups.get_all("parent_group_ids", parent_id)
    }

    pub fn groups_by_member_entity_id(&self, entity_id: &str) -> Result<Vec<Arc<Group>>> {
        self.groups.get_all("member_entity_ids", entity_id)
    }

    pub fn groups_by_bucket_key_hash(&self, hash: &str) -> Result<Vec<Arc<Group>>> {
        self.groups.get_all("bucket_key_hash", hash)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<Group>> + '_ {
        self.groups.iter()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    // Mutation

    /// Insert or replace an entity together with its aliases.
    ///
    /// Aliases the previous version owned are dropped from the alias table
    /// first, so an alias removed from the entity disappears from the
    /// index too.
    pub fn upsert_entity(&mut self, entity: Entity) -> Result<()> {
        self.delete_entity_aliases(&entity.id);
        for alias in &entity.aliases {
            self.entity_aliases.insert(alias.clone())?;
        }
        self.entities.insert(entity)?;
        Ok(())
    }

    /// Remove an entity and its aliases
    pub fn delete_entity(&mut self, id: &str) -> Option<Arc<Entity>> {
        self.delete_entity_aliases(id);
        self.entities.delete(id)
    }

    fn delete_entity_aliases(&mut self, entity_id: &str) {
        let Some(existing) = self.entities.get(entity_id) else {
            return;
        };
        for alias in &existing.aliases {
            self.entity_aliases.delete(&alias.id);
        }
    }

    /// Insert or replace a group together with its alias
    pub fn upsert_group(&mut self, group: Group) -> Result<()> {
        self.delete_group_alias_of(&group.id);
        if let Some(alias) = &group.alias {
            self.group_aliases.insert(alias.clone())?;
        }
        self.groups.insert(group)?;
        Ok(())
    }

    /// Remove a group and its alias
    pub fn delete_group(&mut self, id: &str) -> Option<Arc<Group>> {
        self.delete_group_alias_of(id);
        self.groups.delete(id)
    }

    fn delete_group_alias_of(&mut self, group_id: &str) {
        let alias_id = self
            .groups
            .get(group_id)
            .and_then(|g| g.alias.as_ref().map(|a| a.id.clone()));
        if let Some(alias_id) = alias_id {
            self.group_aliases.delete(&alias_id);
        }
    }
}

/// Transactional cache over [`Tables`]
pub struct MemDb {
    committed: ArcSwap<Tables>,
    write_lock: Mutex<()>,
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDb {
    pub fn new() -> Self {
        Self {
            committed: ArcSwap::from_pointee(Tables::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Open a read transaction on the latest committed snapshot.
    pub fn read(&self) -> ReadTxn {
        ReadTxn {
            snapshot: self.committed.load_full(),
        }
    }

    /// Open a write transaction, waiting for any active writer.
    pub fn write(&self) -> WriteTxn<'_> {
        let guard = self.write_lock.lock();
        let working = Tables::clone(&self.committed.load());
        WriteTxn {
            db: self,
            working,
            _guard: guard,
        }
    }
}

/// Stable view of one committed snapshot
#[derive(Clone)]
pub struct ReadTxn {
    snapshot: Arc<Tables>,
}

impl Deref for ReadTxn {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.snapshot
    }
}

/// Exclusive write transaction.
///
/// Reads through the transaction see its own uncommitted writes.
pub struct WriteTxn<'a> {
    db: &'a MemDb,
    working: Tables,
    _guard: MutexGuard<'a, ()>,
}

impl WriteTxn<'_> {
    /// Publish every change made in this transaction.
    pub fn commit(self) {
        let WriteTxn { db, working, _guard } = self;
        db.committed.store(Arc::new(working));
    }

    /// Discard every change made in this transaction.
    pub fn abort(self) {}
}

impl Deref for WriteTxn<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.working
    }
}

impl DerefMut for WriteTxn<'_> {
    fn deref_mut(&mut self) -> &mut Tables {
        &mut self.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias(id: &str, canonical: &str, accessor: &str, name: &str) -> Alias {
        Alias {
            id: id.to_string(),
            canonical_id: canonical.to_string(),
            name: name.to_string(),
            mount_accessor: accessor.to_string(),
            ..Default::default()
        }
    }

    fn entity(id: &str, name: &str, aliases: Vec<Alias>) -> Entity {
        Entity {
            id: id.to_string(),
            name: name.to_string(),
            aliases,
            ..Default::default()
        }
    }

    #[test]
    fn test_commit_publishes_and_abort_discards() {
        let db = MemDb::new();

        let mut txn = db.write();
        txn.upsert_entity(entity("e1", "alice", vec![])).unwrap();
        assert!(txn.entity_by_id("e1").is_some());
        assert!(db.read().entity_by_id("e1").is_none());
        txn.commit();
        assert!(db.read().entity_by_id("e1").is_some());

        let mut txn = db.write();
        txn.delete_entity("e1");
        txn.abort();
        assert!(db.read().entity_by_id("e1").is_some());
    }

    #[test]
    fn test_reader_keeps_old_snapshot() {
        let db = MemDb::new();
        let before = db.read();

        let mut txn = db.write();
        txn.upsert_entity(entity("e1", "alice", vec![])).unwrap();
        txn.commit();

        assert!(before.entity_by_id("e1").is_none());
        assert!(db.read().entity_by_id("e1").is_some());
    }

    #[test]
    fn test_entity_upsert_replaces_aliases() {
        let db = MemDb::new();
        let mut txn = db.write();
        txn.upsert_entity(entity("e1", "alice", vec![alias("a1", "e1", "acc", "alice")]))
            .unwrap();
        txn.upsert_entity(entity("e1", "alice", vec![alias("a2", "e1", "acc", "al")]))
            .unwrap();
        txn.commit();

        let read = db.read();
        assert!(read.entity_alias_by_id("a1").is_none());
        assert!(read.entity_alias_by_factors("acc", "alice").unwrap().is_none());
        assert_eq!(
            read.entity_alias_by_factors("acc", "al").unwrap().unwrap().id,
            "a2"
        );
        assert_eq!(read.entity_by_alias_id("a2").unwrap().id, "e1");
    }

    #[test]
    fn test_alias_factor_collision_rejected() {
        let db = MemDb::new();
        let mut txn = db.write();
        txn.upsert_entity(entity("e1", "alice", vec![alias("a1", "e1", "acc", "alice")]))
            .unwrap();
        let err = txn
            .upsert_entity(entity("e2", "bob", vec![alias("a2", "e2", "acc", "alice")]))
            .unwrap_err();
        assert!(matches!(err, MemDbError::UniqueViolation { index: "factors", .. }));
    }

    #[test]
    fn test_delete_entity_drops_aliases() {
        let db = MemDb::new();
        let mut txn = db.write();
        txn.upsert_entity(entity("e1", "alice", vec![alias("a1", "e1", "acc", "alice")]))
            .unwrap();
        txn.delete_entity("e1");
        assert!(txn.entity_alias_by_id("a1").is_none());
        assert!(txn.entity_aliases_by_canonical_id("e1").unwrap().is_empty());
    }

    #[test]
    fn test_group_indexes() {
        let db = MemDb::new();
        let mut txn = db.write();
        txn.upsert_group(Group {
            id: "g1".to_string(),
            name: "eng".to_string(),
            policies: vec!["p1".to_string()],
            member_entity_ids: vec!["e1".to_string()],
            parent_group_ids: vec!["g0".to_string()],
            alias: Some(alias("ga1", "g1", "ldap", "engineers")),
            ..Default::default()
        })
        .unwrap();
        txn.commit();

        let read = db.read();
        assert_eq!(read.group_by_name("eng").unwrap().unwrap().id, "g1");
        assert_eq!(read.groups_by_policy("p1").unwrap().len(), 1);
        assert_eq!(read.groups_by_parent_group_id("g0").unwrap().len(), 1);
        assert_eq!(read.groups_by_member_entity_id("e1").unwrap().len(), 1);
        assert_eq!(
            read.group_alias_by_factors("ldap", "engineers").unwrap().unwrap().id,
            "ga1"
        );
        // Group aliases live in their own namespace
        assert!(read.entity_alias_by_factors("ldap", "engineers").unwrap().is_none());
    }

    #[test]
    fn test_entity_metadata_and_merged_indexes() {
        let db = MemDb::new();
        let mut txn = db.write();
        let mut e = entity("e1", "alice", vec![]);
        e.metadata.insert("team".to_string(), "core".to_string());
        e.merged_entity_ids.push("e0".to_string());
        txn.upsert_entity(e).unwrap();

        assert_eq!(txn.entities_by_metadata("team", "core").unwrap().len(), 1);
        assert!(txn.entities_by_metadata("team", "other").unwrap().is_empty());
        assert_eq!(txn.entity_by_merged_entity_id("e0").unwrap().unwrap().id, "e1");
    }
}
