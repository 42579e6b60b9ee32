use anyhow::Result;
use clap::Subcommand;
use idgraph_identity::{Alias, Group, GroupAliasRequest, GroupRequest, GroupType, IdentityStore};

use crate::entity::metadata_arg;
use crate::{print_found, print_json};

#[derive(Subcommand)]
pub enum GroupCommands {
    /// Create a group, or update the one with --id
    Write {
        #[arg(long)]
        id: Option<String>,

        #[command(flatten)]
        fields: GroupFields,
    },

    /// Create or update the group with this name
    WriteByName {
        #[arg(id = "group_name", value_name = "NAME")]
        name: String,

        #[command(flatten)]
        fields: GroupFields,
    },

    Read {
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        id: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },

    Delete {
        #[arg(value_name = "ID")]
        id: String,
    },

    DeleteByName {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// List groups, optionally only those granting a policy
    List {
        #[arg(long)]
        names: bool,

        #[arg(long)]
        policy: Option<String>,
    },

    /// Show the transitive policy set of an entity
    Policies {
        #[arg(value_name = "ENTITY_ID")]
        entity_id: String,
    },
}

#[derive(clap::Args)]
pub struct GroupFields {
    #[arg(long)]
    name: Option<String>,

    /// internal or external
    #[arg(long = "type")]
    group_type: Option<GroupType>,

    #[arg(long = "metadata", value_name = "KEY=VALUE")]
    metadata: Vec<String>,

    #[arg(long, value_delimiter = ',', num_args = 0..)]
    policies: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',', num_args = 0..)]
    member_entity_ids: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',', num_args = 0..)]
    member_group_ids: Option<Vec<String>>,
}

impl GroupFields {
    fn into_request(self) -> Result<GroupRequest> {
        Ok(GroupRequest {
            name: self.name,
            group_type: self.group_type,
            metadata: metadata_arg(&self.metadata)?,
            policies: self.policies,
            member_entity_ids: self.member_entity_ids,
            member_group_ids: self.member_group_ids,
        })
    }
}

pub fn run_group(command: GroupCommands, store: &IdentityStore) -> Result<()> {
    match command {
        GroupCommands::Write { id, fields } => {
            let req = fields.into_request()?;
            let group = match id {
                Some(id) => store.update_group(&id, req)?,
                None => store.register_group(req)?,
            };
            print_json(&*group)
        }
        GroupCommands::WriteByName { name, fields } => {
            let group = store.upsert_group_by_name(&name, fields.into_request()?)?;
            print_json(&*group)
        }
        GroupCommands::Read { id, name } => {
            let group = match (id, name) {
                (Some(id), _) => store.read_group(&id),
                (None, Some(name)) => store.read_group_by_name(&name)?,
                (None, None) => None,
            };
            print_found(group.as_deref())
        }
        GroupCommands::Delete { id } => {
            store.delete_group(&id)?;
            Ok(())
        }
        GroupCommands::DeleteByName { name } => {
            store.delete_group_by_name(&name)?;
            Ok(())
        }
        GroupCommands::List { names, policy } => {
            if names {
                return print_json(&store.list_group_names());
            }
            let groups = match policy {
                Some(policy) => store.groups_by_policy(&policy)?,
                None => store.list_groups(),
            };
            let groups: Vec<&Group> = groups.iter().map(|g| g.as_ref()).collect();
            print_json(&groups)
        }
        GroupCommands::Policies { entity_id } => {
            print_json(&store.group_policies_by_entity_id(&entity_id)?)
        }
    }
}

#[derive(Subcommand)]
pub enum GroupAliasCommands {
    /// Attach an alias to an external group, or update the one with --id
    Write {
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        canonical_id: Option<String>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        mount_accessor: Option<String>,
    },

    Read {
        #[arg(value_name = "ID")]
        id: String,
    },

    Delete {
        #[arg(value_name = "ID")]
        id: String,
    },

    List,
}

pub fn run_group_alias(command: GroupAliasCommands, store: &IdentityStore) -> Result<()> {
    match command {
        GroupAliasCommands::Write {
            id,
            canonical_id,
            name,
            mount_accessor,
        } => {
            let resp = store.register_group_alias(GroupAliasRequest {
                id,
                canonical_id,
                name,
                mount_accessor,
            })?;
            print_json(&resp)
        }
        GroupAliasCommands::Read { id } => print_found(store.read_group_alias(&id).as_deref()),
        GroupAliasCommands::Delete { id } => {
            store.delete_group_alias(&id)?;
            Ok(())
        }
        GroupAliasCommands::List => {
            let aliases = store.list_group_aliases();
            let aliases: Vec<&Alias> = aliases.iter().map(|a| a.as_ref()).collect();
            print_json(&aliases)
        }
    }
}
