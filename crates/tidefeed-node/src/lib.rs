//! # tidefeed-node
//!
//! The offline-first sync engine of a tidefeed device. Local mutations land
//! in the store immediately and are replayed to the owner's other devices
//! whenever a peer connection is available.
//!
//! [`spawn_orchestrator`] takes ownership of the database, the identity,
//! the content store and the peer manager handle, and returns a
//! [`NodeHandle`] for commands and the [`NodeEvent`] stream.

pub mod config;
pub mod content;
pub mod error;
pub mod events;
pub mod handle;
pub mod orchestrator;
pub mod pinning;

pub use config::NodeConfig;
pub use content::{ContentStore, FsContentStore, MemoryContentStore};
pub use error::{NodeError, Result};
pub use events::NodeEvent;
pub use handle::{NodeHandle, SyncReport};
pub use orchestrator::{confirmed_id, pin_record_id, spawn_orchestrator, NodeParts};
pub use pinning::decide_scope;
