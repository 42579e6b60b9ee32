//! Cross-field lookup of entities and groups.

use std::sync::Arc;

use crate::entity::{entity_view, EntityView};
use crate::error::{IdentityError, Result};
use crate::memdb::Tables;
use crate::types::{Entity, Group};
use crate::IdentityStore;

/// Exactly one criterion must be set: `id`, `name`, `alias_id`, or the
/// `alias_name` + `alias_mount_accessor` pair.
#[derive(Debug, Clone, Default)]
pub struct LookupQuery {
    pub id: Option<String>,
    pub name: Option<String>,
    pub alias_id: Option<String>,
    pub alias_name: Option<String>,
    pub alias_mount_accessor: Option<String>,
}

enum Criterion<'a> {
    Id(&'a str),
    Name(&'a str),
    AliasId(&'a str),
    AliasFactors { mount_accessor: &'a str, name: &'a str },
}

fn set(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl LookupQuery {
    fn criterion(&self) -> Result<Criterion<'_>> {
        let alias_name = set(&self.alias_name);
        let alias_accessor = set(&self.alias_mount_accessor);
        if alias_name.is_some() != alias_accessor.is_some() {
            return Err(IdentityError::invalid(
                "both 'alias_name' and 'alias_mount_accessor' need to be set",
            ));
        }

        let mut found = Vec::new();
        if let Some(id) = set(&self.id) {
            found.push(Criterion::Id(id));
        }
        if let Some(name) = set(&self.name) {
            found.push(Criterion::Name(name));
        }
        if let Some(alias_id) = set(&self.alias_id) {
            found.push(Criterion::AliasId(alias_id));
        }
        if let (Some(name), Some(mount_accessor)) = (alias_name, alias_accessor) {
            found.push(Criterion::AliasFactors {
                mount_accessor,
                name,
            });
        }

        match found.len() {
            0 => Err(IdentityError::invalid("missing lookup criteria")),
            1 => Ok(found.remove(0)),
            _ => Err(IdentityError::invalid(
                "query parameters for only one of 'id', 'name', 'alias_id' or the alias name and mount accessor pair are allowed",
            )),
        }
    }
}

fn find_entity(tables: &Tables, query: &LookupQuery) -> Result<Option<Arc<Entity>>> {
    Ok(match query.criterion()? {
        Criterion::Id(id) => tables.entity_by_id(id),
        Criterion::Name(name) => tables.entity_by_name(name)?,
        Criterion::AliasId(alias_id) => tables.entity_by_alias_id(alias_id),
        Criterion::AliasFactors {
            mount_accessor,
            name,
        } => tables
            .entity_alias_by_factors(mount_accessor, name)?
            .and_then(|alias| tables.entity_by_id(&alias.canonical_id)),
    })
}

fn find_group(tables: &Tables, query: &LookupQuery) -> Result<Option<Arc<Group>>> {
    Ok(match query.criterion()? {
        Criterion::Id(id) => tables.group_by_id(id),
        Criterion::Name(name) => tables.group_by_name(name)?,
        Criterion::AliasId(alias_id) => tables
            .group_alias_by_id(alias_id)
            .and_then(|alias| tables.group_by_id(&alias.canonical_id)),
        Criterion::AliasFactors {
            mount_accessor,
            name,
        } => tables
            .group_alias_by_factors(mount_accessor, name)?
            .and_then(|alias| tables.group_by_id(&alias.canonical_id)),
    })
}

impl IdentityStore {
    /// Find an entity by one criterion. An absent entity is `Ok(None)`.
    pub fn lookup_entity(&self, query: &LookupQuery) -> Result<Option<EntityView>> {
        let read = self.db.read();
        match find_entity(&read, query)? {
            Some(entity) => Ok(Some(entity_view(&read, &entity)?)),
            None => Ok(None),
        }
    }

    /// Find a group by one criterion. An absent group is `Ok(None)`.
    pub fn lookup_group(&self, query: &LookupQuery) -> Result<Option<Arc<Group>>> {
        find_group(&self.db.read(), query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store;
    use crate::types::LoginAlias;
    use idgraph_config::testing::TEST_USERPASS_ACCESSOR;

    fn by_name(name: &str) -> LookupQuery {
        LookupQuery {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_entity_by_each_criterion() {
        let store = store();
        let entity = store
            .create_or_fetch_entity(&LoginAlias::new(TEST_USERPASS_ACCESSOR, "alice"))
            .unwrap();
        let alias_id = entity.aliases[0].id.clone();

        let queries = [
            LookupQuery {
                id: Some(entity.id.clone()),
                ..Default::default()
            },
            by_name(&entity.name),
            LookupQuery {
                alias_id: Some(alias_id),
                ..Default::default()
            },
            LookupQuery {
                alias_name: Some("alice".to_string()),
                alias_mount_accessor: Some(TEST_USERPASS_ACCESSOR.to_string()),
                ..Default::default()
            },
        ];
        for query in &queries {
            let found = store.lookup_entity(query).unwrap().unwrap();
            assert_eq!(found.entity.id, entity.id);
        }
    }

    #[test]
    fn test_absent_target_is_none() {
        let store = store();
        assert!(store.lookup_entity(&by_name("nobody")).unwrap().is_none());
        assert!(store.lookup_group(&by_name("nothing")).unwrap().is_none());
    }

    #[test]
    fn test_malformed_queries_are_user_errors() {
        let store = store();
        let bad = [
            LookupQuery::default(),
            LookupQuery {
                id: Some("x".to_string()),
                name: Some("y".to_string()),
                ..Default::default()
            },
            LookupQuery {
                alias_name: Some("alice".to_string()),
                ..Default::default()
            },
        ];
        for query in &bad {
            assert!(store.lookup_entity(query).unwrap_err().is_user_error());
            assert!(store.lookup_group(query).unwrap_err().is_user_error());
        }
    }
}
