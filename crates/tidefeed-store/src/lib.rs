//! # tidefeed-store
//!
//! Durable local state of a tidefeed node, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides the record table (with conflict
//! routing), the append-only mutation log, the profile cache, the sync-meta
//! singleton and the small bookkeeping tables the orchestrator needs.
//! Every local-origin write and its mutation log entry commit in the same
//! transaction: either both are durable or the call fails.

pub mod conflict;
pub mod database;
pub mod ledger;
pub mod migrations;
pub mod models;
pub mod mutation_log;
pub mod profiles;
pub mod records;
pub mod sync_meta;

mod error;

pub use conflict::{ConflictDecision, ConflictStrategy, PreserveLocal, Resolution};
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
