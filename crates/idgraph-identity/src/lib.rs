//! # idgraph-identity
//!
//! The identity graph: entities, their per-mount aliases, and groups
//! arranged in an acyclic hierarchy.
//!
//! ## Layers
//!
//! ```text
//! IdentityStore (locks, validation, merge, resync)
//!   ├── MemDb           transactional multi-index cache
//!   └── StoragePacker   durable bucketed records (entities, groups)
//! ```
//!
//! Every mutation runs inside a [`memdb::WriteTxn`]: the cache is changed
//! first, the touched records are written through the packer, and the
//! transaction commits only when every write succeeded. Any error drops
//! the transaction so the cache never shows a half-applied change.
//!
//! ## Locking
//!
//! Entity mutations take the shard lock of the entity ID (256 shards).
//! Group mutations, and anything that rewrites group membership, take the
//! single group lock for writing. Locks are always taken in the order
//! group lock, entity shard locks, cache write transaction.

pub mod alias;
pub mod entity;
pub mod error;
pub mod group;
pub mod hierarchy;
pub mod loader;
pub mod locks;
pub mod lookup;
pub mod memdb;
pub mod merge;
pub mod mount;
pub mod sanitize;
pub mod types;

pub use alias::{AliasRequest, AliasResponse, GroupAliasRequest};
pub use entity::{EntityRequest, EntityView};
pub use error::{IdentityError, Result};
pub use group::GroupRequest;
pub use hierarchy::GroupDiff;
pub use loader::LoadStats;
pub use lookup::LookupQuery;
pub use memdb::{MemDb, MemDbError, ReadTxn, Tables, WriteTxn};
pub use mount::{MountEntry, MountResolver, StaticMountTable};
pub use types::{Alias, Entity, Group, GroupType, LoginAlias, Metadata};

use std::sync::Arc;

use chrono::Utc;
use idgraph_bucket::{Item, StoragePacker, StorageView};
use idgraph_config::IdentityConfig;
use parking_lot::RwLock;

use crate::locks::LockShards;

/// Owner of the identity graph: cache, durable packers and locks.
pub struct IdentityStore {
    db: MemDb,
    entity_packer: StoragePacker,
    group_packer: StoragePacker,
    entity_locks: LockShards,
    group_lock: RwLock<()>,
    mounts: Arc<dyn MountResolver>,
    config: IdentityConfig,
}

impl IdentityStore {
    /// Create a store with an empty cache over `view`.
    ///
    /// Nothing is read from storage; call [`load`](Self::load) or use
    /// [`open`](Self::open) to populate the cache.
    pub fn new(
        view: Arc<dyn StorageView>,
        mounts: Arc<dyn MountResolver>,
        config: IdentityConfig,
    ) -> Result<Self> {
        let entity_packer = StoragePacker::new(view.clone(), config.entity_prefix.as_str())?;
        let group_packer = StoragePacker::new(view, config.group_prefix.as_str())?;
        Ok(Self {
            db: MemDb::new(),
            entity_packer,
            group_packer,
            entity_locks: LockShards::new(),
            group_lock: RwLock::new(()),
            mounts,
            config,
        })
    }

    /// Create a store and load every persisted record into the cache.
    pub fn open(
        view: Arc<dyn StorageView>,
        mounts: Arc<dyn MountResolver>,
        config: IdentityConfig,
    ) -> Result<Self> {
        let store = Self::new(view, mounts, config)?;
        store.load()?;
        Ok(store)
    }

    /// The cache, for read transactions
    pub fn db(&self) -> &MemDb {
        &self.db
    }

    pub fn entity_packer(&self) -> &StoragePacker {
        &self.entity_packer
    }

    pub fn group_packer(&self) -> &StoragePacker {
        &self.group_packer
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub(crate) fn resolve_mount(&self, accessor: &str) -> Result<MountEntry> {
        self.mounts
            .validate_mount_accessor(accessor)
            .ok_or_else(|| IdentityError::invalid(format!("invalid mount accessor {:?}", accessor)))
    }

    /// Stage an entity in the transaction and optionally persist it.
    pub(crate) fn upsert_entity_in_txn(
        &self,
        txn: &mut WriteTxn<'_>,
        mut entity: Entity,
        persist: bool,
    ) -> Result<()> {
        if persist {
            let now = Utc::now();
            entity.creation_time.get_or_insert(now);
            entity.last_update_time = Some(now);
        }
        txn.upsert_entity(entity.clone())?;
        if persist {
            let message = bincode::serialize(&entity)?;
            self.entity_packer.put_item(Item {
                id: entity.id,
                message,
            })?;
        }
        Ok(())
    }

    /// Stage a group in the transaction and optionally persist it.
    ///
    /// A persisted write bumps the group's modify index.
    pub(crate) fn upsert_group_in_txn(
        &self,
        txn: &mut WriteTxn<'_>,
        mut group: Group,
        persist: bool,
    ) -> Result<()> {
        if persist {
            let now = Utc::now();
            group.creation_time.get_or_insert(now);
            group.last_update_time = Some(now);
            group.modify_index += 1;
        }
        txn.upsert_group(group.clone())?;
        if persist {
            let message = bincode::serialize(&group)?;
            self.group_packer.put_item(Item {
                id: group.id,
                message,
            })?;
        }
        Ok(())
    }
}
