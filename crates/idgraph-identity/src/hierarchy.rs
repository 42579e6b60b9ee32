//! Group hierarchy traversal and external-group resync.
//!
//! Edges point from a member group to its parents through
//! `parent_group_ids`. The `parent_group_ids` index answers the reverse
//! question (the member groups of a group), which is what cycle detection
//! walks. Every traversal keeps a visited set so each group is expanded
//! at most once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use idgraph_config::{log_identity_debug, log_identity_info};

use crate::error::{IdentityError, Result};
use crate::memdb::Tables;
use crate::types::{Group, LoginAlias};
use crate::IdentityStore;

/// Set difference of two group lists, keyed by group ID
#[derive(Debug, Default, Clone)]
pub struct GroupDiff {
    /// Only in the new list
    pub new: Vec<Arc<Group>>,
    /// Only in the old list
    pub deleted: Vec<Arc<Group>>,
    /// In both lists (taken from the new one)
    pub unmodified: Vec<Arc<Group>>,
}

/// Whether `starting_group_id` is reachable among the transitive member
/// groups of `group_id`.
///
/// Called before making `group_id` a member of `starting_group_id`: a hit
/// means the new edge would close a cycle.
pub fn detect_cycle_dfs(
    tables: &Tables,
    visited: &mut HashSet<String>,
    starting_group_id: &str,
    group_id: &str,
) -> Result<bool> {
    if !visited.insert(group_id.to_string()) {
        return Ok(false);
    }
    for child in tables.groups_by_parent_group_id(group_id)? {
        if child.id == starting_group_id {
            return Ok(true);
        }
        if detect_cycle_dfs(tables, visited, starting_group_id, &child.id)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Collect `group` and every ancestor reachable through parent links.
pub fn collect_groups_reverse_dfs(
    tables: &Tables,
    group: &Arc<Group>,
    visited: &mut HashSet<String>,
    groups: &mut Vec<Arc<Group>>,
) -> Result<()> {
    if !visited.insert(group.id.clone()) {
        return Ok(());
    }
    groups.push(group.clone());

    for parent_id in &group.parent_group_ids {
        match tables.group_by_id(parent_id) {
            Some(parent) => collect_groups_reverse_dfs(tables, &parent, visited, groups)?,
            None => log_identity_debug!(
                "Skipping dangling parent group",
                group_id = group.id.as_str(),
                parent_group_id = parent_id.as_str()
            ),
        }
    }
    Ok(())
}

/// Union of the policies of `group` and every ancestor.
pub fn collect_policies_reverse_dfs(
    tables: &Tables,
    group: &Arc<Group>,
    visited: &mut HashSet<String>,
    policies: &mut BTreeSet<String>,
) -> Result<()> {
    if !visited.insert(group.id.clone()) {
        return Ok(());
    }
    policies.extend(group.policies.iter().cloned());

    for parent_id in &group.parent_group_ids {
        if let Some(parent) = tables.group_by_id(parent_id) {
            collect_policies_reverse_dfs(tables, &parent, visited, policies)?;
        }
    }
    Ok(())
}

pub fn diff_groups(old: &[Arc<Group>], new: &[Arc<Group>]) -> GroupDiff {
    let old_ids: HashMap<&str, &Arc<Group>> = old.iter().map(|g| (g.id.as_str(), g)).collect();
    let new_ids: HashSet<&str> = new.iter().map(|g| g.id.as_str()).collect();

    let mut diff = GroupDiff::default();
    for group in new {
        if old_ids.contains_key(group.id.as_str()) {
            diff.unmodified.push(group.clone());
        } else {
            diff.new.push(group.clone());
        }
    }
    for group in old {
        if !new_ids.contains(group.id.as_str()) {
            diff.deleted.push(group.clone());
        }
    }
    diff
}

/// Direct and inherited groups of an entity, each sorted by ID.
pub fn groups_by_entity_id(
    tables: &Tables,
    entity_id: &str,
) -> Result<(Vec<Arc<Group>>, Vec<Arc<Group>>)> {
    let direct = tables.groups_by_member_entity_id(entity_id)?;

    let mut visited = HashSet::new();
    let mut all = Vec::new();
    for group in &direct {
        collect_groups_reverse_dfs(tables, group, &mut visited, &mut all)?;
    }

    let diff = diff_groups(&direct, &all);
    if !diff.deleted.is_empty() {
        return Err(IdentityError::internal(format!(
            "failed to diff group memberships of entity {}",
            entity_id
        )));
    }

    let mut direct = diff.unmodified;
    let mut inherited = diff.new;
    direct.sort_by(|a, b| a.id.cmp(&b.id));
    inherited.sort_by(|a, b| a.id.cmp(&b.id));
    Ok((direct, inherited))
}

/// Every policy an entity inherits through group membership, sorted.
pub fn group_policies_by_entity_id(tables: &Tables, entity_id: &str) -> Result<Vec<String>> {
    let mut visited = HashSet::new();
    let mut policies = BTreeSet::new();
    for group in tables.groups_by_member_entity_id(entity_id)? {
        collect_policies_reverse_dfs(tables, &group, &mut visited, &mut policies)?;
    }
    Ok(policies.into_iter().collect())
}

impl IdentityStore {
    pub fn groups_by_entity_id(&self, entity_id: &str) -> Result<(Vec<Arc<Group>>, Vec<Arc<Group>>)> {
        groups_by_entity_id(&self.db.read(), entity_id)
    }

    pub fn group_policies_by_entity_id(&self, entity_id: &str) -> Result<Vec<String>> {
        group_policies_by_entity_id(&self.db.read(), entity_id)
    }

    /// Sync an entity's external-group memberships with the group aliases
    /// reported by a login on `mount_accessor`.
    ///
    /// Only external groups whose alias lives on `mount_accessor` (or that
    /// lost their alias) are candidates for removal, so a login through
    /// one mount leaves memberships derived from other mounts alone.
    pub fn refresh_external_group_memberships(
        &self,
        entity_id: &str,
        mount_accessor: &str,
        group_aliases: &[LoginAlias],
    ) -> Result<()> {
        if entity_id.is_empty() {
            return Err(IdentityError::invalid("empty entity ID"));
        }

        let _groups = self.group_lock.write();
        let mut txn = self.db.write();

        if txn.entity_by_id(entity_id).is_none() {
            return Err(IdentityError::invalid(format!(
                "entity {} not found",
                entity_id
            )));
        }

        let mut new_groups: Vec<Arc<Group>> = Vec::new();
        for alias in group_aliases {
            let accessor = if alias.mount_accessor.is_empty() {
                mount_accessor
            } else {
                alias.mount_accessor.as_str()
            };
            let Some(group_alias) = txn.group_alias_by_factors(accessor, &alias.name)? else {
                continue;
            };
            let group = txn.group_by_id(&group_alias.canonical_id).ok_or_else(|| {
                IdentityError::internal(format!(
                    "group alias {} has no owning group",
                    group_alias.id
                ))
            })?;
            if !new_groups.iter().any(|g| g.id == group.id) {
                new_groups.push(group);
            }
        }

        let old_groups: Vec<Arc<Group>> = txn
            .groups_by_member_entity_id(entity_id)?
            .into_iter()
            .filter(|g| g.is_external())
            .filter(|g| {
                g.alias
                    .as_ref()
                    .map_or(true, |a| a.mount_accessor == mount_accessor)
            })
            .collect();

        let diff = diff_groups(&old_groups, &new_groups);
        let (added, removed) = (diff.new.len(), diff.deleted.len());

        for group in diff.new {
            let mut group = (*group).clone();
            if !group.member_entity_ids.iter().any(|id| id == entity_id) {
                group.member_entity_ids.push(entity_id.to_string());
            }
            self.upsert_group_in_txn(&mut txn, group, true)?;
        }
        for group in diff.deleted {
            let mut group = (*group).clone();
            group.member_entity_ids.retain(|id| id != entity_id);
            self.upsert_group_in_txn(&mut txn, group, true)?;
        }

        txn.commit();
        if added + removed > 0 {
            log_identity_info!(
                "External group memberships refreshed",
                entity_id = entity_id,
                added = added,
                removed = removed
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memdb::MemDb;

    fn group(id: &str, parents: &[&str], policies: &[&str], members: &[&str]) -> Group {
        Group {
            id: id.to_string(),
            name: format!("name-{}", id),
            parent_group_ids: parents.iter().map(|s| s.to_string()).collect(),
            policies: policies.iter().map(|s| s.to_string()).collect(),
            member_entity_ids: members.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn db_with(groups: Vec<Group>) -> MemDb {
        let db = MemDb::new();
        let mut txn = db.write();
        for g in groups {
            txn.upsert_group(g).unwrap();
        }
        txn.commit();
        db
    }

    #[test]
    fn test_detect_cycle() {
        // g1 is a member of g2, g2 a member of g3
        let db = db_with(vec![
            group("g1", &["g2"], &[], &[]),
            group("g2", &["g3"], &[], &[]),
            group("g3", &[], &[], &[]),
        ]);
        let read = db.read();

        // Making g3 a member of g1 closes g1 -> g2 -> g3 -> g1
        assert!(detect_cycle_dfs(&read, &mut HashSet::new(), "g1", "g3").unwrap());
        // Making g1 a member of g3 only adds a shortcut
        assert!(!detect_cycle_dfs(&read, &mut HashSet::new(), "g3", "g1").unwrap());
    }

    #[test]
    fn test_transitive_policies_and_groups() {
        let db = db_with(vec![
            group("g1", &["g2"], &["p1"], &["e1"]),
            group("g2", &["g3"], &["p2"], &[]),
            group("g3", &[], &["p1", "p3"], &[]),
        ]);
        let read = db.read();

        let policies = group_policies_by_entity_id(&read, "e1").unwrap();
        assert_eq!(policies, vec!["p1", "p2", "p3"]);

        let (direct, inherited) = groups_by_entity_id(&read, "e1").unwrap();
        let ids = |gs: &[Arc<Group>]| gs.iter().map(|g| g.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&direct), vec!["g1"]);
        assert_eq!(ids(&inherited), vec!["g2", "g3"]);
    }

    #[test]
    fn test_reverse_dfs_visits_diamond_once() {
        // g1 has two parents that share an ancestor
        let db = db_with(vec![
            group("g1", &["g2", "g3"], &[], &[]),
            group("g2", &["g4"], &[], &[]),
            group("g3", &["g4"], &[], &[]),
            group("g4", &[], &[], &[]),
        ]);
        let read = db.read();
        let start = read.group_by_id("g1").unwrap();

        let mut collected = Vec::new();
        collect_groups_reverse_dfs(&read, &start, &mut HashSet::new(), &mut collected).unwrap();
        assert_eq!(collected.len(), 4);
    }

    #[test]
    fn test_diff_groups() {
        let a = Arc::new(group("a", &[], &[], &[]));
        let b = Arc::new(group("b", &[], &[], &[]));
        let c = Arc::new(group("c", &[], &[], &[]));

        let diff = diff_groups(&[a.clone(), b.clone()], &[b.clone(), c.clone()]);
        assert_eq!(diff.new[0].id, "c");
        assert_eq!(diff.deleted[0].id, "a");
        assert_eq!(diff.unmodified[0].id, "b");
    }
}
