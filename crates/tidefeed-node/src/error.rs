use thiserror::Error;

use tidefeed_shared::types::ContentId;
use tidefeed_shared::{IdentityError, SharedError};
use tidefeed_store::StoreError;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Local persistence failed; the triggering action did not happen.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Shared(#[from] SharedError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Rejected by policy, e.g. pinning without an authenticated owner.
    #[error("Not allowed: {0}")]
    Policy(String),

    #[error("Not found: {0}")]
    NotFound(ContentId),

    #[error("Content too large: {size} bytes (max {max})")]
    ContentTooLarge { size: usize, max: usize },

    #[error("Content store error: {0}")]
    Content(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Node is not running")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, NodeError>;
