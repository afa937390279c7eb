//! Command surface of a running node.
//!
//! [`NodeHandle`] is the only way into the orchestrator task: every call is
//! a command with a oneshot reply, so all state changes stay serialized on
//! the task.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use tidefeed_net::{PeerDescriptor, PeerHandle};
use tidefeed_shared::types::{ContentId, EntityType, PinKind, UserId};
use tidefeed_store::{MutationLogEntry, PinEntry, Profile, Record, Resolution, SyncMeta};

use crate::error::{NodeError, Result};
use crate::events::NodeEvent;

/// Outcome of one sync round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Deliverable entries found in the mutation log.
    pub pending: usize,
    /// Entries handed to at least one connected peer.
    pub delivered: usize,
    /// Peers reached by the widest broadcast of the round.
    pub peers: usize,
}

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub(crate) enum NodeCommand {
    CreatePost {
        payload: serde_json::Value,
        reply: Reply<Record>,
    },
    UpdatePost {
        content_id: ContentId,
        payload: serde_json::Value,
        reply: Reply<Record>,
    },
    DeletePost {
        content_id: ContentId,
        reply: Reply<Record>,
    },
    Pin {
        content_id: ContentId,
        kind: PinKind,
        reply: Reply<PinEntry>,
    },
    Unpin {
        content_id: ContentId,
        reply: Reply<()>,
    },
    UpdateProfile {
        display_name: Option<String>,
        bio: Option<String>,
        avatar_id: Option<ContentId>,
        reply: Reply<Profile>,
    },
    ResolveConflict {
        content_id: ContentId,
        resolution: Resolution,
        reply: Reply<Record>,
    },
    ListFeed {
        include_deleted: bool,
        reply: Reply<Vec<Record>>,
    },
    GetRecord {
        content_id: ContentId,
        reply: Reply<Option<Record>>,
    },
    GetProfile {
        user_id: UserId,
        reply: Reply<Option<Profile>>,
    },
    PendingMutations {
        entity_type: Option<EntityType>,
        reply: Reply<Vec<MutationLogEntry>>,
    },
    PutContent {
        bytes: Vec<u8>,
        reply: Reply<ContentId>,
    },
    GetContent {
        content_id: ContentId,
        reply: Reply<Vec<u8>>,
    },
    ListPinned {
        reply: Reply<Vec<ContentId>>,
    },
    SetOwner {
        owner: Option<UserId>,
        reply: Reply<()>,
    },
    SyncNow {
        reply: Reply<SyncReport>,
    },
    SyncMeta {
        reply: Reply<SyncMeta>,
    },
    Shutdown,
}

/// Cloneable handle to the orchestrator task.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    pub(crate) tx: mpsc::Sender<NodeCommand>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    pub(crate) peers: PeerHandle,
}

impl NodeHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> NodeCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Create a post under a temporary local id. Works offline.
    pub async fn create_post(&self, payload: serde_json::Value) -> Result<Record> {
        self.request(|reply| NodeCommand::CreatePost { payload, reply })
            .await
    }

    pub async fn update_post(&self, content_id: &ContentId, payload: serde_json::Value) -> Result<Record> {
        let content_id = content_id.clone();
        self.request(|reply| NodeCommand::UpdatePost {
            content_id,
            payload,
            reply,
        })
        .await
    }

    /// Soft delete; the record stays until the delete is acknowledged.
    pub async fn delete_post(&self, content_id: &ContentId) -> Result<Record> {
        let content_id = content_id.clone();
        self.request(|reply| NodeCommand::DeletePost { content_id, reply })
            .await
    }

    /// Pin content with a scope computed from the owner's device roster.
    pub async fn pin(&self, content_id: &ContentId, kind: PinKind) -> Result<PinEntry> {
        let content_id = content_id.clone();
        self.request(|reply| NodeCommand::Pin {
            content_id,
            kind,
            reply,
        })
        .await
    }

    pub async fn unpin(&self, content_id: &ContentId) -> Result<()> {
        let content_id = content_id.clone();
        self.request(|reply| NodeCommand::Unpin { content_id, reply })
            .await
    }

    pub async fn update_profile(
        &self,
        display_name: Option<String>,
        bio: Option<String>,
        avatar_id: Option<ContentId>,
    ) -> Result<Profile> {
        self.request(|reply| NodeCommand::UpdateProfile {
            display_name,
            bio,
            avatar_id,
            reply,
        })
        .await
    }

    pub async fn resolve_conflict(&self, content_id: &ContentId, resolution: Resolution) -> Result<Record> {
        let content_id = content_id.clone();
        self.request(|reply| NodeCommand::ResolveConflict {
            content_id,
            resolution,
            reply,
        })
        .await
    }

    /// Posts and pins, most recent first.
    pub async fn list_feed(&self, include_deleted: bool) -> Result<Vec<Record>> {
        self.request(|reply| NodeCommand::ListFeed {
            include_deleted,
            reply,
        })
        .await
    }

    pub async fn get_record(&self, content_id: &ContentId) -> Result<Option<Record>> {
        let content_id = content_id.clone();
        self.request(|reply| NodeCommand::GetRecord { content_id, reply })
            .await
    }

    pub async fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>> {
        let user_id = *user_id;
        self.request(|reply| NodeCommand::GetProfile { user_id, reply })
            .await
    }

    pub async fn pending_mutations(&self, entity_type: Option<EntityType>) -> Result<Vec<MutationLogEntry>> {
        self.request(|reply| NodeCommand::PendingMutations { entity_type, reply })
            .await
    }

    pub async fn put_content(&self, bytes: Vec<u8>) -> Result<ContentId> {
        self.request(|reply| NodeCommand::PutContent { bytes, reply })
            .await
    }

    pub async fn get_content(&self, content_id: &ContentId) -> Result<Vec<u8>> {
        let content_id = content_id.clone();
        self.request(|reply| NodeCommand::GetContent { content_id, reply })
            .await
    }

    pub async fn list_pinned(&self) -> Result<Vec<ContentId>> {
        self.request(|reply| NodeCommand::ListPinned { reply }).await
    }

    /// Switch the authenticated owner. `None` signs the node out: posting
    /// and pinning are rejected until an owner is set again.
    pub async fn set_owner(&self, owner: Option<UserId>) -> Result<()> {
        self.request(|reply| NodeCommand::SetOwner { owner, reply })
            .await
    }

    /// Run a sync round now instead of waiting for the next trigger.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.request(|reply| NodeCommand::SyncNow { reply }).await
    }

    pub async fn sync_meta(&self) -> Result<SyncMeta> {
        self.request(|reply| NodeCommand::SyncMeta { reply }).await
    }

    /// Read-only view of the peer table.
    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        self.peers.peers().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(NodeCommand::Shutdown).await;
    }
}
