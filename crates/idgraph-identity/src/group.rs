//! Group registration, hierarchy edits, reads and deletion.

use std::collections::HashSet;
use std::sync::Arc;

use idgraph_config::{log_identity_debug, log_identity_info};

use crate::error::{IdentityError, Result};
use crate::hierarchy::detect_cycle_dfs;
use crate::memdb::WriteTxn;
use crate::sanitize::{dedup_ids, new_id, sanitize_alias, sanitize_policies, validate_metadata};
use crate::types::{Group, GroupType, Metadata};
use crate::IdentityStore;

/// Fields of a group write. `None` leaves the field unchanged.
///
/// `member_group_ids` replaces the full set of member groups: groups left
/// out lose this group as a parent.
#[derive(Debug, Clone, Default)]
pub struct GroupRequest {
    pub name: Option<String>,
    pub group_type: Option<GroupType>,
    pub metadata: Option<Metadata>,
    pub policies: Option<Vec<String>>,
    pub member_entity_ids: Option<Vec<String>>,
    pub member_group_ids: Option<Vec<String>>,
}

impl IdentityStore {
    /// Create a new group.
    pub fn register_group(&self, req: GroupRequest) -> Result<Arc<Group>> {
        let _groups = self.group_lock.write();
        let mut txn = self.db.write();
        let group = self.apply_group_request(&mut txn, None, req)?;
        txn.commit();

        log_identity_info!(
            "Group registered",
            group_id = group.id.as_str(),
            group_type = group.group_type.as_str()
        );
        Ok(group)
    }

    /// Update an existing group.
    pub fn update_group(&self, id: &str, req: GroupRequest) -> Result<Arc<Group>> {
        let _groups = self.group_lock.write();
        let mut txn = self.db.write();
        let existing = txn
            .group_by_id(id)
            .ok_or_else(|| IdentityError::invalid(format!("group not found from id {:?}", id)))?;
        let group = self.apply_group_request(&mut txn, Some(existing), req)?;
        txn.commit();
        Ok(group)
    }

    /// Update the group called `name`, or create it.
    pub fn upsert_group_by_name(&self, name: &str, mut req: GroupRequest) -> Result<Arc<Group>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::invalid("empty group name"));
        }
        req.name = Some(name.to_string());

        let _groups = self.group_lock.write();
        let mut txn = self.db.write();
        let existing = txn.group_by_name(name)?;
        let group = self.apply_group_request(&mut txn, existing, req)?;
        txn.commit();
        Ok(group)
    }

    fn apply_group_request(
        &self,
        txn: &mut WriteTxn<'_>,
        existing: Option<Arc<Group>>,
        req: GroupRequest,
    ) -> Result<Arc<Group>> {
        let mut group = existing.as_deref().cloned().unwrap_or_default();

        if let Some(group_type) = req.group_type {
            if existing.is_some() && group.group_type != group_type {
                return Err(IdentityError::invalid("group type cannot be changed"));
            }
            group.group_type = group_type;
        }
        if let Some(name) = req.name {
            let name = name.trim();
            if !name.is_empty() {
                if let Some(other) = txn.group_by_name(name)? {
                    if other.id != group.id {
                        return Err(IdentityError::invalid("group name is already in use"));
                    }
                }
                group.name = name.to_string();
            }
        }
        if let Some(metadata) = req.metadata {
            group.metadata = metadata;
        }
        if let Some(policies) = req.policies {
            group.policies = policies;
        }
        if let Some(members) = req.member_entity_ids {
            if group.is_external() {
                return Err(IdentityError::invalid(
                    "member entities can't be set manually for external groups",
                ));
            }
            group.member_entity_ids = members;
        }
        if req.member_group_ids.is_some() && group.is_external() {
            return Err(IdentityError::invalid(
                "member groups can't be set manually for external groups",
            ));
        }

        self.sanitize_and_upsert_group(txn, group, req.member_group_ids)
    }

    /// Fill defaults, validate references and hierarchy edits, then stage
    /// and persist the group together with every member group it touches.
    pub(crate) fn sanitize_and_upsert_group(
        &self,
        txn: &mut WriteTxn<'_>,
        mut group: Group,
        member_group_ids: Option<Vec<String>>,
    ) -> Result<Arc<Group>> {
        if group.id.is_empty() {
            group.id = new_id();
        }
        if group.bucket_key_hash.is_empty() {
            group.bucket_key_hash = self.group_packer.bucket_key_hash_by_item_id(&group.id);
        }
        if group.name.is_empty() {
            group.name = self.unique_name("group", |name| Ok(txn.group_by_name(name)?.is_some()))?;
        }

        let reserved = self.config.reserved_metadata_prefix.as_str();
        validate_metadata(&group.metadata, reserved)?;
        group.policies = sanitize_policies(std::mem::take(&mut group.policies));

        group.member_entity_ids = dedup_ids(std::mem::take(&mut group.member_entity_ids));
        if group.member_entity_ids.len() > self.config.max_member_entities {
            return Err(IdentityError::invalid(format!(
                "member entity IDs exceed the limit of {}",
                self.config.max_member_entities
            )));
        }
        for entity_id in &group.member_entity_ids {
            if txn.entity_by_id(entity_id).is_none() {
                return Err(IdentityError::invalid(format!(
                    "invalid member entity ID {:?}",
                    entity_id
                )));
            }
        }

        if let Some(alias) = group.alias.as_mut() {
            if group.group_type != GroupType::External {
                return Err(IdentityError::invalid("alias can't be set on an internal group"));
            }
            alias.canonical_id = group.id.clone();
            sanitize_alias(alias, reserved)?;
        }

        // Every member edit is checked before any of them reaches the packer;
        // packer writes survive a dropped txn.
        let mut touched = Vec::new();
        if let Some(member_ids) = member_group_ids {
            let member_ids = dedup_ids(member_ids);

            for member_id in &member_ids {
                if *member_id == group.id {
                    return Err(IdentityError::invalid(
                        "member group ID matches the ID of the group",
                    ));
                }
                let member = txn.group_by_id(member_id).ok_or_else(|| {
                    IdentityError::invalid(format!("invalid member group ID {:?}", member_id))
                })?;
                if member.parent_group_ids.contains(&group.id) {
                    continue;
                }
                if detect_cycle_dfs(txn, &mut HashSet::new(), &group.id, member_id)? {
                    return Err(IdentityError::invalid(format!(
                        "cyclic relationship detected for member group ID {:?}",
                        member_id
                    )));
                }
                let mut member = (*member).clone();
                member.parent_group_ids.push(group.id.clone());
                touched.push(member);
            }

            for current in txn.groups_by_parent_group_id(&group.id)? {
                if member_ids.contains(&current.id) {
                    continue;
                }
                let mut dropped = (*current).clone();
                dropped.parent_group_ids.retain(|p| *p != group.id);
                touched.push(dropped);
            }
        }

        for member in touched {
            self.upsert_group_in_txn(txn, member, true)?;
        }
        let id = group.id.clone();
        self.upsert_group_in_txn(txn, group, true)?;
        txn.group_by_id(&id)
            .ok_or_else(|| IdentityError::internal(format!("group {} vanished after insert", id)))
    }

    pub fn read_group(&self, id: &str) -> Option<Arc<Group>> {
        self.db.read().group_by_id(id)
    }

    pub fn read_group_by_name(&self, name: &str) -> Result<Option<Arc<Group>>> {
        Ok(self.db.read().group_by_name(name)?)
    }

    /// IDs of the groups that are direct members of `id`
    pub fn member_group_ids(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .db
            .read()
            .groups_by_parent_group_id(id)?
            .iter()
            .map(|g| g.id.clone())
            .collect())
    }

    /// Delete a group and its alias, and unlink it from its member groups.
    /// Deleting an unknown ID is a no-op.
    pub fn delete_group(&self, id: &str) -> Result<()> {
        let _groups = self.group_lock.write();
        let mut txn = self.db.write();
        if txn.group_by_id(id).is_none() {
            return Ok(());
        }

        for child in txn.groups_by_parent_group_id(id)? {
            let mut child = (*child).clone();
            child.parent_group_ids.retain(|p| p != id);
            self.upsert_group_in_txn(&mut txn, child, true)?;
        }

        txn.delete_group(id);
        self.group_packer.delete_item(id)?;
        txn.commit();

        log_identity_debug!("Group deleted", group_id = id);
        Ok(())
    }

    pub fn delete_group_by_name(&self, name: &str) -> Result<()> {
        let existing = self.db.read().group_by_name(name)?;
        match existing {
            Some(group) => self.delete_group(&group.id),
            None => Ok(()),
        }
    }

    /// All groups, ordered by ID
    pub fn list_groups(&self) -> Vec<Arc<Group>> {
        self.db.read().groups().cloned().collect()
    }

    /// All group names, sorted
    pub fn list_group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.db.read().groups().map(|g| g.name.clone()).collect();
        names.sort();
        names
    }

    pub fn groups_by_policy(&self, policy: &str) -> Result<Vec<Arc<Group>>> {
        Ok(self.db.read().groups_by_policy(policy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRequest;
    use crate::test_support::{store, store_on};
    use idgraph_bucket::MemoryView;

    fn named(name: &str) -> GroupRequest {
        GroupRequest {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn with_members(name: &str, members: &[&str]) -> GroupRequest {
        GroupRequest {
            member_group_ids: Some(members.iter().map(|s| s.to_string()).collect()),
            ..named(name)
        }
    }

    #[test]
    fn test_register_defaults() {
        let store = store();
        let group = store.register_group(GroupRequest::default()).unwrap();

        assert!(group.name.starts_with("group_"));
        assert_eq!(group.group_type, GroupType::Internal);
        assert_eq!(group.modify_index, 1);
        assert!(store.group_packer.get_item(&group.id).unwrap().is_some());
    }

    #[test]
    fn test_modify_index_increments() {
        let store = store();
        let group = store.register_group(named("eng")).unwrap();
        let updated = store
            .update_group(
                &group.id,
                GroupRequest {
                    policies: Some(vec!["p1".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.modify_index, group.modify_index + 1);
        assert_eq!(updated.creation_time, group.creation_time);
    }

    #[test]
    fn test_type_is_immutable() {
        let store = store();
        let group = store.register_group(named("eng")).unwrap();
        let err = store
            .update_group(
                &group.id,
                GroupRequest {
                    group_type: Some(GroupType::External),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "group type cannot be changed");
    }

    #[test]
    fn test_external_group_rejects_manual_members() {
        let store = store();
        let entity = store.register_entity(EntityRequest::default()).unwrap();
        let err = store
            .register_group(GroupRequest {
                group_type: Some(GroupType::External),
                member_entity_ids: Some(vec![entity.id.clone()]),
                ..named("ext")
            })
            .unwrap_err();
        assert!(err.is_user_error());
        assert!(store.list_groups().is_empty());
    }

    #[test]
    fn test_member_entities_validated_and_deduplicated() {
        let store = store();
        let entity = store.register_entity(EntityRequest::default()).unwrap();

        let group = store
            .register_group(GroupRequest {
                member_entity_ids: Some(vec![entity.id.clone(), entity.id.clone()]),
                ..named("eng")
            })
            .unwrap();
        assert_eq!(group.member_entity_ids, vec![entity.id.clone()]);

        let err = store
            .register_group(GroupRequest {
                member_entity_ids: Some(vec!["ghost".to_string()]),
                ..named("ops")
            })
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_member_entity_limit() {
        let store = IdentityStore::new(
            std::sync::Arc::new(idgraph_bucket::MemoryView::new()),
            crate::test_support::mounts(),
            idgraph_config::IdentityConfig {
                max_member_entities: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let ids: Vec<String> = (0..3)
            .map(|_| store.register_entity(EntityRequest::default()).unwrap().id.clone())
            .collect();

        let err = store
            .register_group(GroupRequest {
                member_entity_ids: Some(ids),
                ..named("big")
            })
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_member_groups_set_parent_ids() {
        let store = store();
        let child = store.register_group(named("child")).unwrap();
        let parent = store
            .register_group(with_members("parent", &[child.id.as_str()]))
            .unwrap();

        let child = store.read_group(&child.id).unwrap();
        assert_eq!(child.parent_group_ids, vec![parent.id.clone()]);
        assert_eq!(store.member_group_ids(&parent.id).unwrap(), vec![child.id.clone()]);
    }

    #[test]
    fn test_dropped_member_group_loses_parent() {
        let store = store();
        let a = store.register_group(named("a")).unwrap();
        let b = store.register_group(named("b")).unwrap();
        let parent = store
            .register_group(with_members("parent", &[a.id.as_str(), b.id.as_str()]))
            .unwrap();

        store
            .update_group(
                &parent.id,
                GroupRequest {
                    member_group_ids: Some(vec![b.id.clone()]),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(store.read_group(&a.id).unwrap().parent_group_ids.is_empty());
        assert_eq!(store.read_group(&b.id).unwrap().parent_group_ids, vec![parent.id.clone()]);
    }

    #[test]
    fn test_self_membership_rejected() {
        let store = store();
        let group = store.register_group(named("loop")).unwrap();
        let err = store
            .update_group(
                &group.id,
                GroupRequest {
                    member_group_ids: Some(vec![group.id.clone()]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let store = store();
        let g1 = store.register_group(named("g1")).unwrap();
        let g2 = store
            .register_group(with_members("g2", &[g1.id.as_str()]))
            .unwrap();
        let g3 = store
            .register_group(with_members("g3", &[g2.id.as_str()]))
            .unwrap();

        // g3 as a member of g1 closes g1 -> g2 -> g3 -> g1
        let err = store
            .update_group(
                &g1.id,
                GroupRequest {
                    member_group_ids: Some(vec![g3.id.clone()]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("cyclic relationship"));

        assert!(store.read_group(&g3.id).unwrap().parent_group_ids.is_empty());
        assert_eq!(store.read_group(&g1.id).unwrap().modify_index, g1.modify_index + 1);
    }

    #[test]
    fn test_rejected_member_groups_leave_storage_unchanged() {
        let view = Arc::new(MemoryView::new());
        let store = store_on(view.clone());
        let child = store.register_group(named("child")).unwrap();
        let a = store.register_group(named("a")).unwrap();
        let parent = store
            .register_group(with_members("parent", &[child.id.as_str()]))
            .unwrap();

        let err = store
            .update_group(
                &parent.id,
                GroupRequest {
                    member_group_ids: Some(vec![a.id.clone(), "ghost".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(err.is_user_error());

        let reloaded = store_on(view);
        for store in [&store, &reloaded] {
            assert_eq!(
                store.read_group(&child.id).unwrap().parent_group_ids,
                vec![parent.id.clone()]
            );
            assert!(store.read_group(&a.id).unwrap().parent_group_ids.is_empty());
            assert_eq!(store.read_group(&parent.id).unwrap().modify_index, parent.modify_index);
        }
    }

    #[test]
    fn test_name_uniqueness_and_upsert_by_name() {
        let store = store();
        let first = store.upsert_group_by_name("eng", GroupRequest::default()).unwrap();
        let again = store
            .upsert_group_by_name(
                "eng",
                GroupRequest {
                    policies: Some(vec!["p".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first.id, again.id);

        let other = store.register_group(named("ops")).unwrap();
        let err = store.update_group(&other.id, named("eng")).unwrap_err();
        assert_eq!(err.to_string(), "group name is already in use");
        assert_eq!(store.list_group_names(), vec!["eng", "ops"]);
        assert_eq!(store.groups_by_policy("p").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_unlinks_children() {
        let store = store();
        let child = store.register_group(named("child")).unwrap();
        let parent = store
            .register_group(with_members("parent", &[child.id.as_str()]))
            .unwrap();

        store.delete_group_by_name("parent").unwrap();

        assert!(store.read_group(&parent.id).is_none());
        assert!(store.read_group(&child.id).unwrap().parent_group_ids.is_empty());
        assert!(store.group_packer.get_item(&parent.id).unwrap().is_none());
        store.delete_group(&parent.id).unwrap();
    }
}
