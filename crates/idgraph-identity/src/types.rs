//! Identity records: entities, aliases and groups.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form string metadata attached to records
pub type Metadata = BTreeMap<String, String>;

/// Canonical identity aggregating aliases from any number of mounts.
///
/// Every alias in `aliases` has `canonical_id == id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub metadata: Metadata,
    pub policies: Vec<String>,
    pub aliases: Vec<Alias>,
    /// IDs of entities absorbed into this one by merges
    pub merged_entity_ids: Vec<String>,
    /// Hash of the storage bucket this entity is packed into
    pub bucket_key_hash: String,
    pub disabled: bool,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn alias_by_id(&self, alias_id: &str) -> Option<&Alias> {
        self.aliases.iter().find(|a| a.id == alias_id)
    }

    pub fn alias_by_mount_accessor(&self, mount_accessor: &str) -> Option<&Alias> {
        self.aliases
            .iter()
            .find(|a| a.mount_accessor == mount_accessor)
    }
}

/// Identifier of an entity or group on one auth mount.
///
/// `(mount_accessor, name)` is unique within the entity-alias namespace
/// and, separately, within the group-alias namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub id: String,
    /// Owning entity ID, or group ID for group aliases
    pub canonical_id: String,
    pub name: String,
    pub mount_accessor: String,
    pub mount_type: String,
    pub mount_path: String,
    pub metadata: Metadata,
    /// Previous owners, appended each time a merge moves the alias
    pub merged_from_canonical_ids: Vec<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Whether a group's membership is managed directly or derived from an
/// external identity provider through its alias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    #[default]
    Internal,
    External,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Internal => "internal",
            GroupType::External => "external",
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "internal" => Ok(GroupType::Internal),
            "external" => Ok(GroupType::External),
            other => Err(format!("invalid group type {:?}", other)),
        }
    }
}

/// Named, policy-bearing collection of entities and other groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub group_type: GroupType,
    pub metadata: Metadata,
    pub policies: Vec<String>,
    pub member_entity_ids: Vec<String>,
    /// Groups this group is a member of
    pub parent_group_ids: Vec<String>,
    /// Group alias, external groups only
    pub alias: Option<Alias>,
    pub bucket_key_hash: String,
    /// Incremented on every persisted mutation
    pub modify_index: u64,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Group {
    pub fn is_external(&self) -> bool {
        self.group_type == GroupType::External
    }
}

/// Alias presented by an auth method at login time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginAlias {
    pub name: String,
    pub mount_accessor: String,
    pub mount_type: String,
    pub metadata: Metadata,
}

impl LoginAlias {
    pub fn new(mount_accessor: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_accessor: mount_accessor.into(),
            ..Default::default()
        }
    }
}
