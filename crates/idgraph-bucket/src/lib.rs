//! # idgraph-bucket
//!
//! Hash-sharded bucket storage for identity records.
//!
//! Records are packed into a fixed number of buckets so that writing one
//! record rewrites a single bucket instead of the whole corpus. A record's
//! bucket is chosen from the first byte of the BLAKE3 hash of its ID.
//!
//! ## Storage Layout
//!
//! ```text
//! <view root>/
//! └── packer/
//!     ├── buckets/           # entity buckets
//!     │   ├── 0
//!     │   ├── ...
//!     │   └── 255
//!     └── group/buckets/     # group buckets
//! ```
//!
//! Each bucket file is a bincode-encoded [`Bucket`] holding every item
//! currently hashed to it.
//!
//! ## Storage Views
//!
//! The packer only needs a byte-oriented get/put/delete/list service,
//! expressed by [`StorageView`]:
//! - [`FileView`]: one file per key with atomic temp-file + rename writes
//! - [`MemoryView`]: in-process map, for tests and ephemeral stores
//! - [`PrefixView`]: scopes another view under a private sub-path

mod file_view;
mod packer;
mod view;

pub use file_view::FileView;
pub use packer::{Bucket, Item, StoragePacker};
pub use view::{MemoryView, PrefixView, StorageView};

use std::io;

use thiserror::Error;

/// Number of buckets per packer
pub const NUM_BUCKETS: usize = 256;

/// BLAKE3 hash type (32 bytes)
pub type Blake3Hash = [u8; 32];

/// Errors that can occur during bucket storage operations
#[derive(Error, Debug)]
pub enum BucketError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Invalid storage key: {key:?}")]
    InvalidKey { key: String },

    #[error("Item ID is empty")]
    MissingItemId,

    #[error("Bucket {key} is corrupted: {reason}")]
    Corrupted { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, BucketError>;

/// Compute the BLAKE3 hash of the given bytes.
#[inline]
pub fn compute_hash(data: &[u8]) -> Blake3Hash {
    *blake3::hash(data).as_bytes()
}

/// Convert a hash to its hex string representation.
#[inline]
pub fn hash_to_hex(hash: &Blake3Hash) -> String {
    hex::encode(hash)
}

/// Bucket index (0..=255) for an item ID.
///
/// Stable for the lifetime of the ID; also used to pick lock shards.
#[inline]
pub fn bucket_index(item_id: &str) -> usize {
    compute_hash(item_id.as_bytes())[0] as usize % NUM_BUCKETS
}
