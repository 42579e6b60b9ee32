//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary storage roots
//! - A config pointing at them
//! - A small static mount table
//!
//! # Usage
//!
//! ```ignore
//! use idgraph_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.storage_root and env.config() are isolated per test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, MountConfig, StorageBackend};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Accessor of the userpass mount every test environment registers
pub const TEST_USERPASS_ACCESSOR: &str = "auth_userpass_1234";

/// Accessor of the ldap mount every test environment registers
pub const TEST_LDAP_ACCESSOR: &str = "auth_ldap_5678";

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated storage root directory
    pub storage_root: PathBuf,
    /// Directory for config files written by the test
    pub config_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let storage_root = root.join(format!("storage-{}", test_id));
        let config_dir = root.join(".idgraph");

        std::fs::create_dir_all(&storage_root)?;
        std::fs::create_dir_all(&config_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            storage_root,
            config_dir,
            test_id,
        })
    }

    /// Config rooted in this environment, with the test mounts registered
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.storage_root.clone();
        cfg.storage.backend = StorageBackend::File;
        cfg.mounts = Self::test_mounts();
        cfg
    }

    /// The mount table shared by all test environments
    pub fn test_mounts() -> Vec<MountConfig> {
        vec![
            MountConfig {
                accessor: TEST_USERPASS_ACCESSOR.to_string(),
                mount_type: "userpass".to_string(),
                path: "auth/userpass/".to_string(),
            },
            MountConfig {
                accessor: TEST_LDAP_ACCESSOR.to_string(),
                mount_type: "ldap".to_string(),
                path: "auth/ldap/".to_string(),
            },
        ]
    }

    /// Write a config file into the environment and return its path
    pub fn write_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.config_dir.join("config.toml");
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
