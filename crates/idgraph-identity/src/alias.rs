//! Entity aliases and group aliases.

use std::sync::Arc;

use idgraph_config::{log_identity_info, log_identity_warn};
use serde::Serialize;

use crate::error::{IdentityError, Result};
use crate::sanitize::{new_id, sanitize_alias};
use crate::types::{Alias, Entity, Metadata};
use crate::IdentityStore;

/// Fields of an entity-alias write.
///
/// Without `id` a new alias is created; with it the alias is updated, and
/// a different `canonical_id` transfers it to another entity.
#[derive(Debug, Clone, Default)]
pub struct AliasRequest {
    pub id: Option<String>,
    pub canonical_id: Option<String>,
    pub name: Option<String>,
    pub mount_accessor: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Fields of a group-alias write
#[derive(Debug, Clone, Default)]
pub struct GroupAliasRequest {
    pub id: Option<String>,
    pub canonical_id: Option<String>,
    pub name: Option<String>,
    pub mount_accessor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AliasResponse {
    pub id: String,
    pub canonical_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

fn pick(requested: Option<String>, current: Option<&str>) -> String {
    requested
        .filter(|v| !v.is_empty())
        .or_else(|| current.map(str::to_string))
        .unwrap_or_default()
}

impl IdentityStore {
    /// Create or update an entity alias.
    pub fn register_entity_alias(&self, req: AliasRequest) -> Result<AliasResponse> {
        match req.id.clone().filter(|id| !id.is_empty()) {
            Some(id) => self.update_entity_alias(&id, req),
            None => self.create_entity_alias(req),
        }
    }

    fn create_entity_alias(&self, req: AliasRequest) -> Result<AliasResponse> {
        let name = pick(req.name, None);
        if name.is_empty() {
            return Err(IdentityError::invalid("missing alias name"));
        }
        let accessor = pick(req.mount_accessor, None);
        if accessor.is_empty() {
            return Err(IdentityError::invalid("missing mount_accessor"));
        }
        let mount = self.resolve_mount(&accessor)?;

        let requested = req.canonical_id.filter(|id| !id.is_empty());
        let entity_id = requested.clone().unwrap_or_else(new_id);
        let _lock = self.entity_locks.lock(&entity_id);
        let mut txn = self.db.write();

        if txn.entity_alias_by_factors(&accessor, &name)?.is_some() {
            return Err(IdentityError::invalid(
                "combination of mount and alias name is already in use",
            ));
        }

        let mut entity = match (txn.entity_by_id(&entity_id), requested) {
            (Some(existing), _) => (*existing).clone(),
            (None, Some(_)) => {
                return Err(IdentityError::invalid(format!(
                    "invalid canonical ID {:?}",
                    entity_id
                )));
            }
            (None, None) => {
                let mut fresh = Entity {
                    id: entity_id.clone(),
                    ..Default::default()
                };
                self.sanitize_entity(&txn, &mut fresh)?;
                fresh
            }
        };
        if entity.alias_by_mount_accessor(&accessor).is_some() {
            return Err(IdentityError::invalid(
                "alias already exists for requested entity and mount accessor",
            ));
        }

        let mut alias = Alias {
            canonical_id: entity.id.clone(),
            name,
            mount_accessor: mount.mount_accessor,
            mount_type: mount.mount_type,
            mount_path: mount.mount_path,
            metadata: req.metadata.unwrap_or_default(),
            ..Default::default()
        };
        sanitize_alias(&mut alias, &self.config.reserved_metadata_prefix)?;
        let response = AliasResponse {
            id: alias.id.clone(),
            canonical_id: entity.id.clone(),
            warnings: Vec::new(),
        };
        entity.aliases.push(alias);

        self.upsert_entity_in_txn(&mut txn, entity, true)?;
        txn.commit();

        log_identity_info!(
            "Entity alias created",
            alias_id = response.id.as_str(),
            entity_id = response.canonical_id.as_str()
        );
        Ok(response)
    }

    fn update_entity_alias(&self, alias_id: &str, req: AliasRequest) -> Result<AliasResponse> {
        let current = self
            .db
            .read()
            .entity_alias_by_id(alias_id)
            .ok_or_else(|| IdentityError::invalid(format!("alias not found for ID {:?}", alias_id)))?;

        let old_owner = current.canonical_id.clone();
        let new_owner = pick(req.canonical_id, Some(&old_owner));
        // Shared group lock orders this two-shard acquisition against merges
        let _groups = self.group_lock.read();
        let (_first, _second) = self.entity_locks.lock_pair(&old_owner, &new_owner);
        let mut txn = self.db.write();

        // Re-read under the locks; the alias may have moved meanwhile
        let current = txn
            .entity_alias_by_id(alias_id)
            .ok_or_else(|| IdentityError::invalid(format!("alias not found for ID {:?}", alias_id)))?;
        if current.canonical_id != old_owner {
            return Err(IdentityError::internal(format!(
                "alias {} changed owner while waiting for its lock",
                alias_id
            )));
        }

        let name = pick(req.name, Some(&current.name));
        let accessor = pick(req.mount_accessor, Some(&current.mount_accessor));
        let mount = self.resolve_mount(&accessor)?;

        if let Some(other) = txn.entity_alias_by_factors(&accessor, &name)? {
            if other.id != current.id {
                return Err(IdentityError::invalid(
                    "combination of mount and alias name is already in use",
                ));
            }
        }

        let mut alias = (*current).clone();
        alias.name = name;
        alias.mount_accessor = mount.mount_accessor;
        alias.mount_type = mount.mount_type;
        alias.mount_path = mount.mount_path;
        if let Some(metadata) = req.metadata {
            alias.metadata = metadata;
        }

        let mut old_entity = txn
            .entity_by_id(&old_owner)
            .map(|e| (*e).clone())
            .ok_or_else(|| {
                IdentityError::internal(format!("alias {} has no owning entity", alias_id))
            })?;

        let mut warnings = Vec::new();
        if new_owner == old_owner {
            if let Some(other) = old_entity.alias_by_mount_accessor(&alias.mount_accessor) {
                if other.id != alias.id {
                    return Err(IdentityError::invalid(
                        "alias already exists for requested entity and mount accessor",
                    ));
                }
            }
            sanitize_alias(&mut alias, &self.config.reserved_metadata_prefix)?;
            for slot in old_entity.aliases.iter_mut() {
                if slot.id == alias.id {
                    *slot = alias.clone();
                }
            }
            self.upsert_entity_in_txn(&mut txn, old_entity, true)?;
        } else {
            let mut new_entity = txn
                .entity_by_id(&new_owner)
                .map(|e| (*e).clone())
                .ok_or_else(|| {
                    IdentityError::invalid(format!("invalid canonical ID {:?}", new_owner))
                })?;
            if new_entity
                .alias_by_mount_accessor(&alias.mount_accessor)
                .is_some()
            {
                return Err(IdentityError::invalid(
                    "alias already exists for requested entity and mount accessor",
                ));
            }

            let warning = format!(
                "alias is being transferred from entity {} to {}",
                old_owner, new_owner
            );
            log_identity_warn!(
                "Entity alias transferred",
                alias_id = alias_id,
                from_entity_id = old_owner.as_str(),
                to_entity_id = new_owner.as_str()
            );
            warnings.push(warning);

            alias.canonical_id = new_entity.id.clone();
            sanitize_alias(&mut alias, &self.config.reserved_metadata_prefix)?;
            old_entity.aliases.retain(|a| a.id != alias.id);
            new_entity.aliases.push(alias.clone());

            // The old owner must drop the alias before the new one claims it
            self.upsert_entity_in_txn(&mut txn, old_entity, true)?;
            self.upsert_entity_in_txn(&mut txn, new_entity, true)?;
        }

        txn.commit();
        Ok(AliasResponse {
            id: alias.id,
            canonical_id: alias.canonical_id,
            warnings,
        })
    }

    pub fn read_entity_alias(&self, id: &str) -> Option<Arc<Alias>> {
        self.db.read().entity_alias_by_id(id)
    }

    /// Detach and delete an entity alias. Unknown IDs are a no-op.
    pub fn delete_entity_alias(&self, id: &str) -> Result<()> {
        let Some(alias) = self.db.read().entity_alias_by_id(id) else {
            return Ok(());
        };
        let _lock = self.entity_locks.lock(&alias.canonical_id);
        let mut txn = self.db.write();

        let Some(alias) = txn.entity_alias_by_id(id) else {
            return Ok(());
        };
        let mut entity = txn
            .entity_by_id(&alias.canonical_id)
            .map(|e| (*e).clone())
            .ok_or_else(|| IdentityError::internal(format!("alias {} has no owning entity", id)))?;
        entity.aliases.retain(|a| a.id != id);

        self.upsert_entity_in_txn(&mut txn, entity, true)?;
        txn.commit();
        Ok(())
    }

    /// All entity aliases, ordered by ID
    pub fn list_entity_aliases(&self) -> Vec<Arc<Alias>> {
        self.db.read().entity_aliases().cloned().collect()
    }

    /// Create or update a group alias. Only external groups carry one.
    pub fn register_group_alias(&self, req: GroupAliasRequest) -> Result<AliasResponse> {
        let _groups = self.group_lock.write();
        let mut txn = self.db.write();

        let existing = match req.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => Some(txn.group_alias_by_id(id).ok_or_else(|| {
                IdentityError::invalid(format!("invalid group alias ID {:?}", id))
            })?),
            None => None,
        };

        let name = pick(req.name, existing.as_ref().map(|a| a.name.as_str()));
        if name.is_empty() {
            return Err(IdentityError::invalid("missing alias name"));
        }
        let accessor = pick(
            req.mount_accessor,
            existing.as_ref().map(|a| a.mount_accessor.as_str()),
        );
        if accessor.is_empty() {
            return Err(IdentityError::invalid("missing mount_accessor"));
        }
        let mount = self.resolve_mount(&accessor)?;
        let group_id = pick(
            req.canonical_id,
            existing.as_ref().map(|a| a.canonical_id.as_str()),
        );
        if group_id.is_empty() {
            return Err(IdentityError::invalid("missing canonical_id"));
        }

        if let Some(other) = txn.group_alias_by_factors(&accessor, &name)? {
            if existing.as_ref().map_or(true, |e| e.id != other.id) {
                return Err(IdentityError::invalid(
                    "combination of mount and group alias name is already in use",
                ));
            }
        }

        let mut group = txn
            .group_by_id(&group_id)
            .map(|g| (*g).clone())
            .ok_or_else(|| {
                IdentityError::invalid(format!("invalid group ID {:?} in canonical_id", group_id))
            })?;
        if !group.is_external() {
            return Err(IdentityError::invalid("alias can't be set on an internal group"));
        }
        if let Some(current) = &group.alias {
            if existing.as_ref().map_or(true, |e| e.id != current.id) {
                return Err(IdentityError::invalid("group already has an alias"));
            }
        }

        // Moving the alias to another group clears it from the old one
        if let Some(prev) = existing.as_ref().filter(|e| e.canonical_id != group_id) {
            if let Some(old_group) = txn.group_by_id(&prev.canonical_id) {
                let mut old_group = (*old_group).clone();
                old_group.alias = None;
                self.upsert_group_in_txn(&mut txn, old_group, true)?;
            }
        }

        let mut alias = existing.map(|a| (*a).clone()).unwrap_or_default();
        alias.name = name;
        alias.mount_accessor = mount.mount_accessor;
        alias.mount_type = mount.mount_type;
        alias.mount_path = mount.mount_path;
        alias.canonical_id = group.id.clone();
        sanitize_alias(&mut alias, &self.config.reserved_metadata_prefix)?;

        let response = AliasResponse {
            id: alias.id.clone(),
            canonical_id: group.id.clone(),
            warnings: Vec::new(),
        };
        group.alias = Some(alias);
        self.sanitize_and_upsert_group(&mut txn, group, None)?;
        txn.commit();

        log_identity_info!(
            "Group alias registered",
            alias_id = response.id.as_str(),
            group_id = response.canonical_id.as_str()
        );
        Ok(response)
    }

    pub fn read_group_alias(&self, id: &str) -> Option<Arc<Alias>> {
        self.db.read().group_alias_by_id(id)
    }

    /// Detach and delete a group alias. Unknown IDs are a no-op.
    pub fn delete_group_alias(&self, id: &str) -> Result<()> {
        let _groups = self.group_lock.write();
        let mut txn = self.db.write();

        let Some(alias) = txn.group_alias_by_id(id) else {
            return Ok(());
        };
        let mut group = txn
            .group_by_id(&alias.canonical_id)
            .map(|g| (*g).clone())
            .ok_or_else(|| {
                IdentityError::internal(format!("group alias {} has no owning group", id))
            })?;
        group.alias = None;

        self.upsert_group_in_txn(&mut txn, group, true)?;
        txn.commit();
        Ok(())
    }

    /// All group aliases, ordered by ID
    pub fn list_group_aliases(&self) -> Vec<Arc<Alias>> {
        self.db.read().group_aliases().cloned().collect()
    }
}
