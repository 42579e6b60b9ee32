//! Entity merge.
//!
//! Merging folds one or more "from" entities into a "to" entity: their
//! aliases are reparented, their IDs are recorded in the target's merged
//! history and they are deleted. The target's shard lock is taken first,
//! then the remaining shards of the "from" entities. Every shard lock is
//! held for the whole merge under the group write lock, so merges run one
//! at a time and block group edits while they run.
//!
//! The cache side is one write transaction, aborted on any error. All
//! "from" entities and alias conflicts are resolved before anything is
//! written, so rejected input leaves storage untouched. Durable deletes
//! then happen per entity and are not rolled back if a later write fails
//! with an I/O error; the target is written last.

use std::collections::HashSet;

use chrono::Utc;
use idgraph_config::log_identity_info;

use crate::error::{IdentityError, Result};
use crate::sanitize::dedup_ids;
use crate::IdentityStore;

impl IdentityStore {
    /// Merge `from_ids` into `to_id`.
    ///
    /// When a "from" entity holds an alias on a mount the target already
    /// has an alias on, the merge is rejected unless `force` is set, in
    /// which case the conflicting "from" alias is dropped.
    pub fn merge_entities(&self, from_ids: &[String], to_id: &str, force: bool) -> Result<()> {
        if to_id.is_empty() {
            return Err(IdentityError::invalid("missing entity ID to merge to"));
        }
        let from_ids = dedup_ids(from_ids.to_vec());
        if from_ids.is_empty() {
            return Err(IdentityError::invalid("missing entity IDs to merge from"));
        }
        if from_ids.iter().any(|id| id == to_id) {
            return Err(IdentityError::invalid(
                "to_entity_id should not be present in from_entity_ids",
            ));
        }

        // Group memberships move with the merged entities
        let _groups = self.group_lock.write();
        let to_shard = self.entity_locks.shard_index(to_id);
        let _to_lock = self.entity_locks.lock(to_id);
        // Shard locks are taken before the cache transaction opens; shards
        // shared with the target are already held
        let other_shards: Vec<&String> = from_ids
            .iter()
            .filter(|id| self.entity_locks.shard_index(id) != to_shard)
            .collect();
        let _from_locks = self.entity_locks.lock_many(&other_shards);
        let mut txn = self.db.write();

        let to_entity = txn
            .entity_by_id(to_id)
            .ok_or_else(|| IdentityError::invalid("entity ID to merge to is invalid"))?;
        if to_entity.id != to_id {
            return Err(IdentityError::internal(format!(
                "entity lock for {} resolved to entity {}",
                to_id, to_entity.id
            )));
        }
        let mut to_entity = (*to_entity).clone();

        // Resolve every source and its conflicts before the first durable write
        let mut accessors: HashSet<String> = to_entity
            .aliases
            .iter()
            .map(|a| a.mount_accessor.clone())
            .collect();
        let mut sources = Vec::with_capacity(from_ids.len());
        for from_id in &from_ids {
            let from_entity = txn.entity_by_id(from_id).ok_or_else(|| {
                IdentityError::invalid(format!("entity ID to merge from {:?} is invalid", from_id))
            })?;
            if from_entity.id != *from_id {
                return Err(IdentityError::internal(format!(
                    "entity lock for {} resolved to entity {}",
                    from_id, from_entity.id
                )));
            }

            let mut conflicts = Vec::new();
            for alias in &from_entity.aliases {
                if !accessors.insert(alias.mount_accessor.clone()) {
                    conflicts.push(alias.id.clone());
                }
            }
            if !conflicts.is_empty() && !force {
                return Err(IdentityError::invalid(format!(
                    "conflicting mount accessors in following alias IDs: {}",
                    conflicts.join(", ")
                )));
            }
            sources.push((from_entity, conflicts));
        }

        let now = Utc::now();
        for (from_entity, conflicts) in sources {
            let from_id = from_entity.id.as_str();
            for alias in &from_entity.aliases {
                if conflicts.contains(&alias.id) {
                    continue;
                }
                let mut alias = alias.clone();
                alias.merged_from_canonical_ids.push(from_entity.id.clone());
                alias.canonical_id = to_entity.id.clone();
                alias.last_update_time = Some(now);
                to_entity.aliases.push(alias);
            }

            to_entity.merged_entity_ids.push(from_entity.id.clone());
            to_entity
                .merged_entity_ids
                .extend(from_entity.merged_entity_ids.iter().cloned());
            to_entity.merged_entity_ids = dedup_ids(std::mem::take(&mut to_entity.merged_entity_ids));

            for group in txn.groups_by_member_entity_id(from_id)? {
                let mut group = (*group).clone();
                for member in group.member_entity_ids.iter_mut() {
                    if member == from_id {
                        *member = to_entity.id.clone();
                    }
                }
                group.member_entity_ids = dedup_ids(std::mem::take(&mut group.member_entity_ids));
                self.upsert_group_in_txn(&mut txn, group, true)?;
            }

            txn.delete_entity(from_id);
            self.entity_packer.delete_item(from_id)?;

            log_identity_info!(
                "Entity merged",
                from_entity_id = from_id,
                to_entity_id = to_id,
                dropped_aliases = conflicts.len()
            );
        }

        self.upsert_entity_in_txn(&mut txn, to_entity, true)?;
        txn.commit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use idgraph_bucket::MemoryView;
    use idgraph_config::testing::{TEST_LDAP_ACCESSOR, TEST_USERPASS_ACCESSOR};

    use crate::entity::EntityRequest;
    use crate::group::GroupRequest;
    use crate::test_support::{store, store_on};
    use crate::types::LoginAlias;

    #[test]
    fn test_merge_reparents_aliases_and_records_history() {
        let store = store();
        let a = store.register_entity(EntityRequest::default()).unwrap();
        let b = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_USERPASS_ACCESSOR, "bob"))
            .unwrap();
        let c = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_LDAP_ACCESSOR, "carl"))
            .unwrap();

        store
            .merge_entities(&[b.id.clone(), c.id.clone()], &a.id, false)
            .unwrap();

        let merged = store.read_entity(&a.id).unwrap().unwrap().entity;
        assert_eq!(merged.aliases.len(), 2);
        for alias in &merged.aliases {
            assert_eq!(alias.canonical_id, a.id);
            assert_eq!(alias.merged_from_canonical_ids.len(), 1);
        }
        assert!(merged.merged_entity_ids.contains(&b.id));
        assert!(merged.merged_entity_ids.contains(&c.id));
        assert!(store.read_entity(&b.id).unwrap().is_none());
        assert!(store.read_entity(&c.id).unwrap().is_none());
        assert_eq!(store.entity_by_merged_entity_id(&b.id).unwrap().unwrap().id, a.id);
        assert!(store.entity_packer.get_item(&b.id).unwrap().is_none());

        // Logging in through a merged alias now lands on the target
        let again = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_USERPASS_ACCESSOR, "bob"))
            .unwrap();
        assert_eq!(again.id, a.id);
    }

    #[test]
    fn test_merge_conflict_requires_force() {
        let store = store();
        let a = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_USERPASS_ACCESSOR, "a"))
            .unwrap();
        let b = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_USERPASS_ACCESSOR, "b"))
            .unwrap();

        let err = store
            .merge_entities(&[b.id.clone()], &a.id, false)
            .unwrap_err();
        assert!(err.to_string().contains(&b.aliases[0].id));
        assert!(store.read_entity(&b.id).unwrap().is_some());

        store.merge_entities(&[b.id.clone()], &a.id, true).unwrap();
        let merged = store.read_entity(&a.id).unwrap().unwrap().entity;
        assert_eq!(merged.aliases.len(), 1);
        assert_eq!(merged.aliases[0].name, "a");
        assert!(store.read_entity_alias(&b.aliases[0].id).is_none());
    }

    #[test]
    fn test_merge_moves_group_membership() {
        let store = store();
        let a = store.register_entity(EntityRequest::default()).unwrap();
        let b = store.register_entity(EntityRequest::default()).unwrap();
        let group = store
            .register_group(GroupRequest {
                member_entity_ids: Some(vec![a.id.clone(), b.id.clone()]),
                ..Default::default()
            })
            .unwrap();

        store.merge_entities(&[b.id.clone()], &a.id, false).unwrap();

        let group = store.read_group(&group.id).unwrap();
        assert_eq!(group.member_entity_ids, vec![a.id.clone()]);
    }

    #[test]
    fn test_merge_input_validation() {
        let store = store();
        let a = store.register_entity(EntityRequest::default()).unwrap();

        for (from, to) in [
            (vec![], a.id.clone()),
            (vec![a.id.clone()], a.id.clone()),
            (vec!["ghost".to_string()], a.id.clone()),
            (vec![a.id.clone()], "ghost".to_string()),
            (vec![a.id.clone()], String::new()),
        ] {
            let err = store.merge_entities(&from, &to, false).unwrap_err();
            assert!(err.is_user_error(), "{:?} -> {:?}", from, to);
        }
        assert!(store.read_entity(&a.id).unwrap().is_some());
    }

    #[test]
    fn test_rejected_merge_keeps_sources_in_storage() {
        let view = Arc::new(MemoryView::new());
        let store = store_on(view.clone());
        let a = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_USERPASS_ACCESSOR, "alice"))
            .unwrap();
        let b = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_LDAP_ACCESSOR, "bob"))
            .unwrap();
        let c = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_USERPASS_ACCESSOR, "carl"))
            .unwrap();

        // A missing source after a valid one
        let err = store
            .merge_entities(&[b.id.clone(), "ghost".to_string()], &a.id, false)
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
        // A conflicting source after a valid one
        let err = store
            .merge_entities(&[b.id.clone(), c.id.clone()], &a.id, false)
            .unwrap_err();
        assert!(err.to_string().contains(&c.aliases[0].id));

        assert!(store.entity_packer.get_item(&b.id).unwrap().is_some());
        let reloaded = store_on(view);
        let target = reloaded.read_entity(&a.id).unwrap().unwrap().entity;
        assert_eq!(target.aliases.len(), 1);
        assert!(target.merged_entity_ids.is_empty());
        let bob = reloaded
            .create_or_fetch_entity(&LoginAlias::new(TEST_LDAP_ACCESSOR, "bob"))
            .unwrap();
        assert_eq!(bob.id, b.id);
        assert!(reloaded.read_entity(&c.id).unwrap().is_some());
    }
}
