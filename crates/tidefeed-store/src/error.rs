use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error. For writes this is a durability failure.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// `resolve_conflict` was called on a record with no pending conflict.
    #[error("No pending conflict for {0}")]
    NoConflict(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Payload or snapshot (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
