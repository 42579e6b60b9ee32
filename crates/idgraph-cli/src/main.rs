//! # idgraph CLI
//!
//! Administrative front end for the idgraph identity store. Every
//! invocation loads the persisted graph, runs one command and prints the
//! result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idgraph_bucket::{FileView, MemoryView, StorageView};
use idgraph_config::{init_logging, log_cli_debug, log_cli_info, Config, StorageBackend};
use idgraph_identity::{IdentityStore, LoginAlias, LookupQuery, StaticMountTable};
use serde::Serialize;

mod entity;
mod group;

/// idgraph - entity, alias and group identity store
#[derive(Parser)]
#[command(name = "idgraph")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the standard locations
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Storage root directory (overrides config)
    #[arg(long, global = true, env = "IDGRAPH_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage entities
    Entity {
        #[command(subcommand)]
        command: entity::EntityCommands,
    },

    /// Manage entity aliases
    Alias {
        #[command(subcommand)]
        command: entity::AliasCommands,
    },

    /// Manage groups
    Group {
        #[command(subcommand)]
        command: group::GroupCommands,
    },

    /// Manage group aliases
    GroupAlias {
        #[command(subcommand)]
        command: group::GroupAliasCommands,
    },

    /// Find an entity or group by exactly one criterion
    Lookup {
        /// Look up a group instead of an entity
        #[arg(long)]
        group: bool,

        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        alias_id: Option<String>,

        #[arg(long)]
        alias_name: Option<String>,

        #[arg(long)]
        alias_mount_accessor: Option<String>,
    },

    /// Fold entities into another entity
    Merge {
        /// Entity that absorbs the others
        #[arg(long = "to")]
        to: String,

        /// Entities to absorb
        #[arg(long = "from", required = true, value_delimiter = ',')]
        from: Vec<String>,

        /// Drop conflicting aliases instead of failing
        #[arg(long)]
        force: bool,
    },

    /// Simulate a login: fetch or create the entity for an alias, then
    /// resync its external group memberships
    Login {
        /// Mount accessor the login came through
        #[arg(long)]
        mount: String,

        /// Alias name on that mount
        #[arg(value_name = "NAME")]
        name: String,

        /// Group names reported by the identity provider
        #[arg(long = "group-alias", value_delimiter = ',')]
        group_aliases: Vec<String>,
    },

    /// Show record counts
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(root) = cli.storage_root.clone() {
        config.storage.root = root;
    }
    init_logging(config.logging.log_level());

    let store = open_store(&config)?;
    run(cli.command, &store)
}

fn open_store(config: &Config) -> Result<IdentityStore> {
    let view: Arc<dyn StorageView> = match config.storage.backend {
        StorageBackend::File => {
            let root = config.storage_root();
            let shown = root.display().to_string();
            log_cli_debug!("Opening file storage", root = shown.as_str());
            Arc::new(
                FileView::new(&root)
                    .with_context(|| format!("Failed to open storage root: {}", root.display()))?,
            )
        }
        StorageBackend::Memory => Arc::new(MemoryView::new()),
    };
    let mounts = Arc::new(StaticMountTable::from_config(&config.mounts));

    let store = IdentityStore::new(view, mounts, config.identity.clone())?;
    let stats = store.load().context("Failed to load identity store")?;
    log_cli_info!(
        "Identity store loaded",
        entities = stats.entities,
        groups = stats.groups,
        duration_ms = stats.duration.as_millis() as u64
    );
    Ok(store)
}

fn run(command: Commands, store: &IdentityStore) -> Result<()> {
    match command {
        Commands::Entity { command } => entity::run_entity(command, store),
        Commands::Alias { command } => entity::run_alias(command, store),
        Commands::Group { command } => group::run_group(command, store),
        Commands::GroupAlias { command } => group::run_group_alias(command, store),
        Commands::Lookup {
            group,
            id,
            name,
            alias_id,
            alias_name,
            alias_mount_accessor,
        } => {
            let query = LookupQuery {
                id,
                name,
                alias_id,
                alias_name,
                alias_mount_accessor,
            };
            if group {
                print_found(store.lookup_group(&query)?.as_deref())
            } else {
                print_found(store.lookup_entity(&query)?.as_ref())
            }
        }
        Commands::Merge { to, from, force } => {
            store.merge_entities(&from, &to, force)?;
            print_found(store.read_entity(&to)?.as_ref())
        }
        Commands::Login {
            mount,
            name,
            group_aliases,
        } => cmd_login(store, &mount, &name, &group_aliases),
        Commands::Stats => cmd_stats(store),
    }
}

fn cmd_login(store: &IdentityStore, mount: &str, name: &str, group_aliases: &[String]) -> Result<()> {
    let entity = store.create_or_fetch_entity(&LoginAlias::new(mount, name))?;
    let aliases: Vec<LoginAlias> = group_aliases
        .iter()
        .map(|g| LoginAlias::new(mount, g.as_str()))
        .collect();
    store.refresh_external_group_memberships(&entity.id, mount, &aliases)?;
    print_found(store.read_entity(&entity.id)?.as_ref())
}

#[derive(Serialize)]
struct Stats {
    entities: usize,
    entity_aliases: usize,
    groups: usize,
    group_aliases: usize,
    entity_buckets: usize,
    group_buckets: usize,
}

fn cmd_stats(store: &IdentityStore) -> Result<()> {
    let tables = store.db().read();
    print_json(&Stats {
        entities: tables.entity_count(),
        entity_aliases: tables.entity_aliases().count(),
        groups: tables.group_count(),
        group_aliases: tables.group_aliases().count(),
        entity_buckets: store.entity_packer().bucket_keys()?.len(),
        group_buckets: store.group_packer().bucket_keys()?.len(),
    })
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a record, or fail with "not found" so scripts see a non-zero exit
pub(crate) fn print_found<T: Serialize + ?Sized>(value: Option<&T>) -> Result<()> {
    match value {
        Some(v) => print_json(v),
        None => anyhow::bail!("not found"),
    }
}
