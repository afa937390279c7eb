//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be snapshotted
//! into the mutation log, replicated to peers and handed to the UI layer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tidefeed_shared::types::{
    ContentId, DeviceClass, EntityType, MutationAction, NetworkStatus, NodeId, PinKind, UserId,
};

/// Where a write comes from. Remote writes to locally modified records are
/// routed through the conflict strategy instead of being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A post or a pinned-content entry, keyed by content id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub content_id: ContentId,
    /// `post` or `pin`.
    pub kind: EntityType,
    pub owner_id: UserId,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub modified: bool,
    #[serde(default)]
    pub deleted: bool,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default)]
    pub local_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<RecordConflict>,
}

impl Record {
    pub fn new(
        content_id: ContentId,
        kind: EntityType,
        owner_id: UserId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            content_id,
            kind,
            owner_id,
            payload,
            synced: false,
            modified: false,
            deleted: false,
            last_modified_at: Utc::now(),
            local_created_at: None,
            conflict: None,
        }
    }

    /// The replicated form: no sync flags, no local conflict bookkeeping.
    pub fn snapshot(&self) -> Self {
        Self {
            synced: false,
            modified: false,
            conflict: None,
            ..self.clone()
        }
    }

    pub fn has_conflict(&self) -> bool {
        self.conflict.is_some()
    }
}

/// A remote candidate that collided with a local in-progress edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordConflict {
    pub remote_version: Box<Record>,
    pub detected_at: DateTime<Utc>,
}

/// Result of [`Database::upsert_record`](crate::Database::upsert_record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The write collided with a local edit and is parked as `conflict.remoteVersion`.
    Conflicted,
    /// Identical or stale remote write; nothing changed.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Mutation log
// ---------------------------------------------------------------------------

/// One local create/update/delete/conflict, immutable once written apart
/// from its `conflict_resolved` flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationLogEntry {
    pub id: Uuid,
    /// Append position, assigned by the log.
    #[serde(default)]
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: MutationAction,
    pub timestamp: DateTime<Utc>,
    pub conflict_resolved: bool,
    pub payload: serde_json::Value,
}

impl MutationLogEntry {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: MutationAction,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            entity_type,
            entity_id: entity_id.into(),
            action,
            timestamp: Utc::now(),
            conflict_resolved: false,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Pin entry (payload of a `pin` record)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PinEntry {
    pub content_id: ContentId,
    pub pin_kind: PinKind,
    pub device_scope: BTreeSet<DeviceClass>,
    pub created_at: DateTime<Utc>,
}

impl PinEntry {
    pub fn covers(&self, class: DeviceClass) -> bool {
        self.device_scope.contains(&class)
    }
}

// ---------------------------------------------------------------------------
// Profile cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_id: Option<ContentId>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub modified: bool,
    #[serde(default)]
    pub synced: bool,
}

// ---------------------------------------------------------------------------
// Sync meta
// ---------------------------------------------------------------------------

/// Process-wide sync bookkeeping, one row per local node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub device_id: NodeId,
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub network_status: NetworkStatus,
}
