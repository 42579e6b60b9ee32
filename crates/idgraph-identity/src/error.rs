use idgraph_bucket::BucketError;
use idgraph_config::log_identity_error;
use thiserror::Error;

use crate::memdb::MemDbError;

/// Errors returned by identity store operations
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Rejected request: bad or missing input, collisions, cycles
    #[error("{0}")]
    InvalidRequest(String),

    /// Broken invariant inside the store
    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] BucketError),

    #[error("cache error: {0}")]
    Cache(#[from] MemDbError),

    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

impl IdentityError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        IdentityError::InvalidRequest(msg.into())
    }

    /// Build an internal error, logging the detail.
    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log_identity_error!("Identity invariant violated", detail = msg.as_str());
        IdentityError::Internal(msg)
    }

    /// Whether the caller's input caused the failure
    pub fn is_user_error(&self) -> bool {
        matches!(self, IdentityError::InvalidRequest(_))
    }

    /// Message safe to hand back to an untrusted caller.
    pub fn public_message(&self) -> String {
        match self {
            IdentityError::InvalidRequest(msg) => msg.clone(),
            _ => "internal error".to_string(),
        }
    }
}
