use anyhow::Result;
use clap::Subcommand;
use idgraph_identity::sanitize::parse_metadata_pairs;
use idgraph_identity::{Alias, AliasRequest, Entity, EntityRequest, IdentityStore, Metadata};

use crate::{print_found, print_json};

#[derive(Subcommand)]
pub enum EntityCommands {
    /// Create an entity, or update the one with --id
    Write {
        #[arg(long)]
        id: Option<String>,

        #[command(flatten)]
        fields: EntityFields,
    },

    /// Create or update the entity with this name
    WriteByName {
        #[arg(id = "entity_name", value_name = "NAME")]
        name: String,

        #[command(flatten)]
        fields: EntityFields,
    },

    /// Show an entity with its group memberships
    Read {
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        id: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },

    /// Delete entities by ID
    Delete {
        #[arg(value_name = "ID", required = true)]
        ids: Vec<String>,
    },

    /// Delete the entity with this name
    DeleteByName {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// List entities, optionally filtered by one metadata pair
    List {
        /// Print only names
        #[arg(long)]
        names: bool,

        #[arg(long, value_name = "KEY=VALUE")]
        metadata: Option<String>,
    },
}

#[derive(clap::Args)]
pub struct EntityFields {
    #[arg(long)]
    name: Option<String>,

    #[arg(long = "metadata", value_name = "KEY=VALUE")]
    metadata: Vec<String>,

    /// Replace the policy list (comma separated; empty clears it)
    #[arg(long, value_delimiter = ',', num_args = 0..)]
    policies: Option<Vec<String>>,

    #[arg(long)]
    disabled: Option<bool>,
}

impl EntityFields {
    fn into_request(self) -> Result<EntityRequest> {
        Ok(EntityRequest {
            name: self.name,
            metadata: metadata_arg(&self.metadata)?,
            policies: self.policies,
            disabled: self.disabled,
        })
    }
}

/// Repeated `--metadata k=v` flags; absent means "leave unchanged"
pub(crate) fn metadata_arg(pairs: &[String]) -> Result<Option<Metadata>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    Ok(Some(parse_metadata_pairs(pairs)?))
}

pub fn run_entity(command: EntityCommands, store: &IdentityStore) -> Result<()> {
    match command {
        EntityCommands::Write { id, fields } => {
            let req = fields.into_request()?;
            let entity = match id {
                Some(id) => store.update_entity(&id, req)?,
                None => store.register_entity(req)?,
            };
            print_found(store.read_entity(&entity.id)?.as_ref())
        }
        EntityCommands::WriteByName { name, fields } => {
            let entity = store.upsert_entity_by_name(&name, fields.into_request()?)?;
            print_found(store.read_entity(&entity.id)?.as_ref())
        }
        EntityCommands::Read { id, name } => {
            let view = match (id, name) {
                (Some(id), _) => store.read_entity(&id)?,
                (None, Some(name)) => store.read_entity_by_name(&name)?,
                (None, None) => None,
            };
            print_found(view.as_ref())
        }
        EntityCommands::Delete { ids } => {
            let deleted = if ids.len() == 1 {
                store.delete_entity(&ids[0])?;
                1
            } else {
                store.batch_delete_entities(&ids)?
            };
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
        EntityCommands::DeleteByName { name } => {
            store.delete_entity_by_name(&name)?;
            Ok(())
        }
        EntityCommands::List { names, metadata } => {
            if names {
                return print_json(&store.list_entity_names());
            }
            let entities = match metadata {
                Some(pair) => {
                    let parsed = parse_metadata_pairs(&[pair])?;
                    let (key, value) = parsed.iter().next().ok_or_else(|| {
                        anyhow::anyhow!("metadata filter needs a key=value pair")
                    })?;
                    store.entities_by_metadata(key, value)?
                }
                None => store.list_entities(),
            };
            let entities: Vec<&Entity> = entities.iter().map(|e| e.as_ref()).collect();
            print_json(&entities)
        }
    }
}

#[derive(Subcommand)]
pub enum AliasCommands {
    /// Create an alias, or update the one with --id
    Write {
        #[arg(long)]
        id: Option<String>,

        /// Owning entity; a new entity is created when omitted
        #[arg(long)]
        canonical_id: Option<String>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        mount_accessor: Option<String>,

        #[arg(long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
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

pub fn run_alias(command: AliasCommands, store: &IdentityStore) -> Result<()> {
    match command {
        AliasCommands::Write {
            id,
            canonical_id,
            name,
            mount_accessor,
            metadata,
        } => {
            let resp = store.register_entity_alias(AliasRequest {
                id,
                canonical_id,
                name,
                mount_accessor,
                metadata: metadata_arg(&metadata)?,
            })?;
            for warning in &resp.warnings {
                tracing::warn!("{}", warning);
            }
            print_json(&resp)
        }
        AliasCommands::Read { id } => print_found(store.read_entity_alias(&id).as_deref()),
        AliasCommands::Delete { id } => {
            store.delete_entity_alias(&id)?;
            Ok(())
        }
        AliasCommands::List => {
            let aliases = store.list_entity_aliases();
            let aliases: Vec<&Alias> = aliases.iter().map(|a| a.as_ref()).collect();
            print_json(&aliases)
        }
    }
}
