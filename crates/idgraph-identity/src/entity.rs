//! Entity registration, reads and deletion.

use std::sync::Arc;

use idgraph_config::{log_identity_debug, log_identity_info};
use serde::Serialize;

use crate::error::{IdentityError, Result};
use crate::hierarchy::{group_policies_by_entity_id, groups_by_entity_id};
use crate::memdb::{Tables, WriteTxn};
use crate::sanitize::{new_id, sanitize_alias};
use crate::types::{Alias, Entity, LoginAlias, Metadata};
use crate::IdentityStore;

/// Fields of an entity write. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct EntityRequest {
    pub name: Option<String>,
    pub metadata: Option<Metadata>,
    pub policies: Option<Vec<String>>,
    pub disabled: Option<bool>,
}

/// An entity together with its resolved group memberships
#[derive(Debug, Clone, Serialize)]
pub struct EntityView {
    #[serde(flatten)]
    pub entity: Entity,
    pub direct_group_ids: Vec<String>,
    pub inherited_group_ids: Vec<String>,
    /// Direct followed by inherited group IDs
    pub group_ids: Vec<String>,
    /// Policies granted through groups, transitively
    pub group_policies: Vec<String>,
}

impl IdentityStore {
    /// Return the entity bound to the login alias, creating the entity and
    /// alias together on first sight.
    pub fn create_or_fetch_entity(&self, login: &LoginAlias) -> Result<Arc<Entity>> {
        if login.name.is_empty() {
            return Err(IdentityError::invalid("empty alias name"));
        }
        if login.mount_accessor.is_empty() {
            return Err(IdentityError::invalid("empty mount accessor"));
        }
        let mount = self.resolve_mount(&login.mount_accessor)?;

        if let Some(entity) = self.entity_by_login(&self.db.read(), login)? {
            return Ok(entity);
        }

        let id = new_id();
        let _lock = self.entity_locks.lock(&id);
        let mut txn = self.db.write();

        // Another login may have created it since the read above
        if let Some(entity) = self.entity_by_login(&txn, login)? {
            return Ok(entity);
        }

        let mut entity = Entity {
            id,
            ..Default::default()
        };
        self.sanitize_entity(&txn, &mut entity)?;

        let mut alias = Alias {
            canonical_id: entity.id.clone(),
            name: login.name.clone(),
            mount_accessor: mount.mount_accessor,
            mount_type: mount.mount_type,
            mount_path: mount.mount_path,
            metadata: login.metadata.clone(),
            ..Default::default()
        };
        sanitize_alias(&mut alias, &self.config.reserved_metadata_prefix)?;
        entity.aliases.push(alias);

        let id = entity.id.clone();
        self.upsert_entity_in_txn(&mut txn, entity, true)?;
        let created = txn
            .entity_by_id(&id)
            .ok_or_else(|| IdentityError::internal(format!("entity {} vanished after insert", id)))?;
        txn.commit();

        log_identity_info!(
            "Entity created from login",
            entity_id = id.as_str(),
            mount_accessor = login.mount_accessor.as_str()
        );
        Ok(created)
    }

    fn entity_by_login(&self, tables: &Tables, login: &LoginAlias) -> Result<Option<Arc<Entity>>> {
        let Some(alias) = tables.entity_alias_by_factors(&login.mount_accessor, &login.name)? else {
            return Ok(None);
        };
        tables.entity_by_id(&alias.canonical_id).map(Some).ok_or_else(|| {
            IdentityError::internal(format!("alias {} has no owning entity", alias.id))
        })
    }

    /// Create a new entity.
    pub fn register_entity(&self, req: EntityRequest) -> Result<Arc<Entity>> {
        let id = new_id();
        let _lock = self.entity_locks.lock(&id);
        let mut txn = self.db.write();

        let entity = Entity {
            id,
            ..Default::default()
        };
        let entity = self.apply_entity_request(&mut txn, entity, req)?;
        txn.commit();

        log_identity_info!("Entity registered", entity_id = entity.id.as_str());
        Ok(entity)
    }

    /// Update an existing entity.
    pub fn update_entity(&self, id: &str, req: EntityRequest) -> Result<Arc<Entity>> {
        let _lock = self.entity_locks.lock(id);
        let mut txn = self.db.write();

        let existing = txn
            .entity_by_id(id)
            .ok_or_else(|| IdentityError::invalid(format!("entity not found from id {:?}", id)))?;
        let entity = self.apply_entity_request(&mut txn, (*existing).clone(), req)?;
        txn.commit();
        Ok(entity)
    }

    /// Update the entity called `name`, or create it.
    pub fn upsert_entity_by_name(&self, name: &str, mut req: EntityRequest) -> Result<Arc<Entity>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::invalid("empty entity name"));
        }
        req.name = Some(name.to_string());

        let existing = self.db.read().entity_by_name(name)?;
        match existing {
            Some(entity) => self.update_entity(&entity.id, req),
            None => self.register_entity(req),
        }
    }

    fn apply_entity_request(
        &self,
        txn: &mut WriteTxn<'_>,
        mut entity: Entity,
        req: EntityRequest,
    ) -> Result<Arc<Entity>> {
        if let Some(name) = req.name {
            let name = name.trim();
            if !name.is_empty() {
                if let Some(other) = txn.entity_by_name(name)? {
                    if other.id != entity.id {
                        return Err(IdentityError::invalid("entity name is already in use"));
                    }
                }
                entity.name = name.to_string();
            }
        }
        if let Some(metadata) = req.metadata {
            entity.metadata = metadata;
        }
        if let Some(policies) = req.policies {
            entity.policies = policies;
        }
        if let Some(disabled) = req.disabled {
            entity.disabled = disabled;
        }

        self.sanitize_entity(txn, &mut entity)?;
        let id = entity.id.clone();
        self.upsert_entity_in_txn(txn, entity, true)?;
        txn.entity_by_id(&id)
            .ok_or_else(|| IdentityError::internal(format!("entity {} vanished after insert", id)))
    }

    /// Entity by ID with its group memberships; `None` when absent.
    pub fn read_entity(&self, id: &str) -> Result<Option<EntityView>> {
        let read = self.db.read();
        match read.entity_by_id(id) {
            Some(entity) => Ok(Some(entity_view(&read, &entity)?)),
            None => Ok(None),
        }
    }

    pub fn read_entity_by_name(&self, name: &str) -> Result<Option<EntityView>> {
        let read = self.db.read();
        match read.entity_by_name(name)? {
            Some(entity) => Ok(Some(entity_view(&read, &entity)?)),
            None => Ok(None),
        }
    }

    /// Delete an entity, its aliases and its group memberships. Deleting
    /// an unknown ID is a no-op.
    pub fn delete_entity(&self, id: &str) -> Result<()> {
        let _groups = self.group_lock.write();
        let _lock = self.entity_locks.lock(id);
        let mut txn = self.db.write();
        if self.delete_entity_in_txn(&mut txn, id)? {
            txn.commit();
        }
        Ok(())
    }

    pub fn delete_entity_by_name(&self, name: &str) -> Result<()> {
        let existing = self.db.read().entity_by_name(name)?;
        match existing {
            Some(entity) => self.delete_entity(&entity.id),
            None => Ok(()),
        }
    }

    /// Delete several entities in one transaction.
    pub fn batch_delete_entities(&self, ids: &[String]) -> Result<usize> {
        let _groups = self.group_lock.write();
        let _locks = self.entity_locks.lock_many(ids);
        let mut txn = self.db.write();

        let mut deleted = 0;
        for id in ids {
            if self.delete_entity_in_txn(&mut txn, id)? {
                deleted += 1;
            }
        }
        txn.commit();
        Ok(deleted)
    }

    pub(crate) fn delete_entity_in_txn(&self, txn: &mut WriteTxn<'_>, id: &str) -> Result<bool> {
        if txn.entity_by_id(id).is_none() {
            return Ok(false);
        }

        for group in txn.groups_by_member_entity_id(id)? {
            let mut group = (*group).clone();
            group.member_entity_ids.retain(|member| member != id);
            self.upsert_group_in_txn(txn, group, true)?;
        }

        txn.delete_entity(id);
        self.entity_packer.delete_item(id)?;

        log_identity_debug!("Entity deleted", entity_id = id);
        Ok(true)
    }

    /// All entities, ordered by ID
    pub fn list_entities(&self) -> Vec<Arc<Entity>> {
        self.db.read().entities().cloned().collect()
    }

    /// All entity names, sorted
    pub fn list_entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .db
            .read()
            .entities()
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn entities_by_metadata(&self, key: &str, value: &str) -> Result<Vec<Arc<Entity>>> {
        Ok(self.db.read().entities_by_metadata(key, value)?)
    }

    /// The surviving entity a merged-away ID was folded into
    pub fn entity_by_merged_entity_id(&self, merged_id: &str) -> Result<Option<Arc<Entity>>> {
        Ok(self.db.read().entity_by_merged_entity_id(merged_id)?)
    }
}

pub(crate) fn entity_view(tables: &Tables, entity: &Entity) -> Result<EntityView> {
    let (direct, inherited) = groups_by_entity_id(tables, &entity.id)?;
    let direct_group_ids: Vec<String> = direct.iter().map(|g| g.id.clone()).collect();
    let inherited_group_ids: Vec<String> = inherited.iter().map(|g| g.id.clone()).collect();
    let group_ids = direct_group_ids
        .iter()
        .chain(inherited_group_ids.iter())
        .cloned()
        .collect();

    Ok(EntityView {
        entity: entity.clone(),
        direct_group_ids,
        inherited_group_ids,
        group_ids,
        group_policies: group_policies_by_entity_id(tables, &entity.id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store;
    use idgraph_config::testing::TEST_USERPASS_ACCESSOR;

    #[test]
    fn test_register_generates_id_and_name() {
        let store = store();
        let entity = store.register_entity(EntityRequest::default()).unwrap();

        assert!(!entity.id.is_empty());
        assert!(entity.name.starts_with("entity_"));
        assert!(entity.aliases.is_empty());
        assert!(!entity.bucket_key_hash.is_empty());
        assert!(entity.creation_time.is_some());
        assert!(store.entity_packer.get_item(&entity.id).unwrap().is_some());
    }

    #[test]
    fn test_name_collision_rejected() {
        let store = store();
        store
            .register_entity(EntityRequest {
                name: Some("alice".to_string()),
                ..Default::default()
            })
            .unwrap();
        let err = store
            .register_entity(EntityRequest {
                name: Some("alice".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(store.list_entities().len(), 1);
    }

    #[test]
    fn test_update_keeps_creation_time() {
        let store = store();
        let created = store.register_entity(EntityRequest::default()).unwrap();
        let updated = store
            .update_entity(
                &created.id,
                EntityRequest {
                    policies: Some(vec!["dev".to_string(), "dev".to_string()]),
                    disabled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.creation_time, created.creation_time);
        assert_eq!(updated.policies, vec!["dev"]);
        assert!(updated.disabled);
        assert_eq!(updated.name, created.name);
    }

    #[test]
    fn test_update_unknown_entity_is_user_error() {
        let store = store();
        let err = store
            .update_entity("missing", EntityRequest::default())
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_upsert_by_name() {
        let store = store();
        let first = store
            .upsert_entity_by_name("bob", EntityRequest::default())
            .unwrap();
        let second = store
            .upsert_entity_by_name(
                "bob",
                EntityRequest {
                    policies: Some(vec!["ops".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.read_entity_by_name("bob").unwrap().unwrap().entity.policies, vec!["ops"]);
    }

    #[test]
    fn test_create_or_fetch_is_idempotent() {
        let store = store();
        let login = LoginAlias::new(TEST_USERPASS_ACCESSOR, "alice");

        let first = store.create_or_fetch_entity(&login).unwrap();
        let second = store.create_or_fetch_entity(&login).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_entities().len(), 1);
        assert_eq!(first.aliases.len(), 1);
        assert_eq!(first.aliases[0].mount_type, "userpass");
        assert_eq!(first.aliases[0].canonical_id, first.id);
    }

    #[test]
    fn test_create_or_fetch_rejects_bad_input() {
        let store = store();
        for login in [
            LoginAlias::new(TEST_USERPASS_ACCESSOR, ""),
            LoginAlias::new("", "alice"),
            LoginAlias::new("auth_unknown", "alice"),
        ] {
            assert!(store.create_or_fetch_entity(&login).unwrap_err().is_user_error());
        }
        assert!(store.list_entities().is_empty());
    }

    #[test]
    fn test_delete_missing_entity_is_noop() {
        let store = store();
        store.delete_entity("nope").unwrap();
        assert!(store.read_entity("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete_by_name_and_batch() {
        let store = store();
        let ids: Vec<String> = (0..3)
            .map(|i| {
                store
                    .upsert_entity_by_name(&format!("user{}", i), EntityRequest::default())
                    .unwrap()
                    .id
                    .clone()
            })
            .collect();

        store.delete_entity_by_name("user0").unwrap();
        assert!(store.read_entity(&ids[0]).unwrap().is_none());

        let deleted = store.batch_delete_entities(&ids).unwrap();
        assert_eq!(deleted, 2);
        assert!(store.list_entities().is_empty());
        assert!(store.entity_packer.get_item(&ids[1]).unwrap().is_none());
    }

    #[test]
    fn test_list_and_metadata_queries() {
        let store = store();
        let mut metadata = Metadata::new();
        metadata.insert("team".to_string(), "core".to_string());
        store
            .upsert_entity_by_name(
                "zed",
                EntityRequest {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .upsert_entity_by_name("amy", EntityRequest::default())
            .unwrap();

        assert_eq!(store.list_entity_names(), vec!["amy", "zed"]);
        let found = store.entities_by_metadata("team", "core").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "zed");
    }

    #[test]
    fn test_reserved_metadata_rejected() {
        let store = store();
        let mut metadata = Metadata::new();
        metadata.insert("idgraph-internal".to_string(), "x".to_string());
        let err = store
            .register_entity(EntityRequest {
                metadata: Some(metadata),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.is_user_error());
        assert!(store.list_entities().is_empty());
    }
}
