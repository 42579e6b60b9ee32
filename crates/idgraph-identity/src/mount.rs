//! Mount accessor resolution.

use std::collections::HashMap;

use idgraph_config::MountConfig;

/// Mount metadata stamped onto every alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_type: String,
    pub mount_accessor: String,
    pub mount_path: String,
}

/// Resolves opaque mount accessors. Supplied by the embedding system.
pub trait MountResolver: Send + Sync {
    /// `None` when the accessor is unknown.
    fn validate_mount_accessor(&self, accessor: &str) -> Option<MountEntry>;
}

/// Fixed mount table, typically built from the `[[mounts]]` config section
#[derive(Debug, Clone, Default)]
pub struct StaticMountTable {
    mounts: HashMap<String, MountEntry>,
}

impl StaticMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(mounts: &[MountConfig]) -> Self {
        let mut table = Self::new();
        for m in mounts {
            table.insert(&m.accessor, &m.mount_type, &m.path);
        }
        table
    }

    pub fn insert(&mut self, accessor: &str, mount_type: &str, path: &str) {
        self.mounts.insert(
            accessor.to_string(),
            MountEntry {
                mount_type: mount_type.to_string(),
                mount_accessor: accessor.to_string(),
                mount_path: path.to_string(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

impl MountResolver for StaticMountTable {
    fn validate_mount_accessor(&self, accessor: &str) -> Option<MountEntry> {
        self.mounts.get(accessor).cloned()
    }
}
