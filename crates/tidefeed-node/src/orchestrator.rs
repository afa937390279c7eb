//! Sync orchestrator.
//!
//! One tokio task owns the database, the content store and the node
//! identity. It serializes three event sources in a single `select!` loop:
//!
//! * commands from [`NodeHandle`] (local mutations and queries),
//! * [`PeerNotification`]s from the peer manager (signaling state, peer
//!   status, inbound sync payloads),
//! * a periodic timer.
//!
//! Outbound sync drains the unresolved entries of the mutation log to every
//! connected peer. An entry stays pending until a peer acknowledges it, so
//! undelivered work is simply retried on the next trigger.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tidefeed_net::{PeerDescriptor, PeerHandle, PeerNotification, SignalingState};
use tidefeed_shared::protocol::{AckEnvelope, MutationEnvelope, SyncMessage};
use tidefeed_shared::types::{
    ContentId, DeviceClass, EntityType, MutationAction, NetworkStatus, NodeId, PeerStatus, PinKind, UserId,
};
use tidefeed_shared::{Identity, SharedError};
use tidefeed_store::{
    Database, MutationLogEntry, Origin, PinEntry, Profile, Record, Resolution, StoreError, UpsertOutcome,
};

use crate::content::ContentStore;
use crate::error::{NodeError, Result};
use crate::events::{emit_event, NodeEvent, EVENT_CHANNEL_CAPACITY};
use crate::handle::{NodeCommand, NodeHandle, SyncReport};
use crate::pinning::decide_scope;

const PIN_ID_PREFIX: &str = "pin:";

/// Everything the orchestrator task takes ownership of.
pub struct NodeParts<C> {
    pub db: Database,
    pub identity: Identity,
    /// Authenticated owner of local content; `None` rejects posting and pinning.
    pub owner: Option<UserId>,
    pub device_class: DeviceClass,
    /// Registered device classes of the owner, first = primary.
    pub roster: Vec<DeviceClass>,
    pub peers: PeerHandle,
    pub notifications: mpsc::Receiver<PeerNotification>,
    pub content: C,
    pub sync_interval: Duration,
    pub retention: chrono::Duration,
}

/// Record key of the pin entry for `content_id`.
pub fn pin_record_id(content_id: &ContentId) -> ContentId {
    ContentId(format!("{PIN_ID_PREFIX}{content_id}"))
}

/// Id a receiving node confirms a locally created post under. Binds the
/// owner and the temporary id as well as the payload, so equal text from
/// two posts never shares an id.
pub fn confirmed_id(owner: &UserId, local_id: &ContentId, payload: &serde_json::Value) -> Result<ContentId> {
    let mut bytes = owner.0.to_vec();
    bytes.extend_from_slice(local_id.as_str().as_bytes());
    bytes.push(0);
    bytes.extend(serde_json::to_vec(payload)?);
    Ok(ContentId::for_bytes(&bytes))
}

/// Only the side with the lower node id dials; the other accepts.
fn should_dial(local: &NodeId, remote: &NodeId) -> bool {
    local < remote
}

/// Start the orchestrator task.
pub fn spawn_orchestrator<C: ContentStore>(parts: NodeParts<C>) -> Result<NodeHandle> {
    let NodeParts {
        db,
        identity,
        owner,
        device_class,
        roster,
        peers,
        notifications,
        content,
        sync_interval,
        retention,
    } = parts;

    let meta = db.load_or_init_sync_meta()?;
    // nothing is connected before the signaling channel says so
    db.set_network_status(NetworkStatus::Offline)?;

    let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(256);
    let (events, _) = broadcast::channel::<NodeEvent>(EVENT_CHANNEL_CAPACITY);

    let handle = NodeHandle {
        tx: cmd_tx,
        events: events.clone(),
        peers: peers.clone(),
    };

    let orchestrator = Orchestrator {
        db,
        identity,
        node_id: meta.device_id,
        owner,
        device_class,
        roster,
        peers,
        content,
        events,
        network: NetworkStatus::Offline,
        sync_interval,
        retention,
        delivered: 0,
        acknowledged: 0,
    };

    tokio::spawn(async move {
        orchestrator.run(cmd_rx, notifications).await;
        info!("Sync orchestrator terminated");
    });

    Ok(handle)
}

struct Orchestrator<C> {
    db: Database,
    identity: Identity,
    node_id: NodeId,
    owner: Option<UserId>,
    device_class: DeviceClass,
    roster: Vec<DeviceClass>,
    peers: PeerHandle,
    content: C,
    events: broadcast::Sender<NodeEvent>,
    network: NetworkStatus,
    sync_interval: Duration,
    retention: chrono::Duration,
    /// Entries handed to peers since the log last drained.
    delivered: usize,
    /// Acks received since the log last drained.
    acknowledged: usize,
}

impl<C: ContentStore> Orchestrator<C> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
        mut notifications: mpsc::Receiver<PeerNotification>,
    ) {
        let mut tick = tokio::time::interval_at(Instant::now() + self.sync_interval, self.sync_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            node = %self.node_id,
            class = %self.device_class,
            "Sync orchestrator started"
        );

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },

                Some(note) = notifications.recv() => self.on_peer_notification(note).await,

                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.peers.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::CreatePost { payload, reply } => {
                let result = self.create_post(payload);
                let entity = result.as_ref().ok().map(|r| r.content_id.to_string());
                let _ = reply.send(result);
                self.deliver_latest(entity).await;
            }

            NodeCommand::UpdatePost {
                content_id,
                payload,
                reply,
            } => {
                let result = self.update_post(&content_id, payload);
                let entity = result.as_ref().ok().map(|r| r.content_id.to_string());
                let _ = reply.send(result);
                self.deliver_latest(entity).await;
            }

            NodeCommand::DeletePost { content_id, reply } => {
                let result = self.delete_post(&content_id);
                let entity = result.as_ref().ok().map(|r| r.content_id.to_string());
                let _ = reply.send(result);
                self.deliver_latest(entity).await;
            }

            NodeCommand::Pin {
                content_id,
                kind,
                reply,
            } => {
                let result = self.pin(&content_id, kind).await;
                let entity = result.as_ref().ok().map(|_| pin_record_id(&content_id).to_string());
                let _ = reply.send(result);
                self.deliver_latest(entity).await;
            }

            NodeCommand::Unpin { content_id, reply } => {
                let result = self.unpin(&content_id).await;
                let entity = result.as_ref().ok().map(|_| pin_record_id(&content_id).to_string());
                let _ = reply.send(result);
                self.deliver_latest(entity).await;
            }

            NodeCommand::UpdateProfile {
                display_name,
                bio,
                avatar_id,
                reply,
            } => {
                let result = self.update_profile(display_name, bio, avatar_id);
                let entity = result.as_ref().ok().map(|p| p.user_id.to_hex());
                let _ = reply.send(result);
                self.deliver_latest(entity).await;
            }

            NodeCommand::ResolveConflict {
                content_id,
                resolution,
                reply,
            } => {
                let result = self.resolve_conflict(&content_id, resolution);
                let entity = result.as_ref().ok().map(|r| r.content_id.to_string());
                let _ = reply.send(result);
                self.deliver_latest(entity).await;
            }

            NodeCommand::ListFeed {
                include_deleted,
                reply,
            } => {
                let _ = reply.send(self.db.list_records(include_deleted).map_err(Into::into));
            }

            NodeCommand::GetRecord { content_id, reply } => {
                let _ = reply.send(self.db.get_record(&content_id).map_err(Into::into));
            }

            NodeCommand::GetProfile { user_id, reply } => {
                let _ = reply.send(self.db.get_profile(&user_id).map_err(Into::into));
            }

            NodeCommand::PendingMutations { entity_type, reply } => {
                let _ = reply.send(self.db.pending_mutations(entity_type).map_err(Into::into));
            }

            NodeCommand::PutContent { bytes, reply } => {
                let _ = reply.send(self.content.put(bytes).await);
            }

            NodeCommand::GetContent { content_id, reply } => {
                let _ = reply.send(self.content.get(&content_id).await);
            }

            NodeCommand::ListPinned { reply } => {
                let _ = reply.send(self.content.list_pinned().await);
            }

            NodeCommand::SetOwner { owner, reply } => {
                match owner {
                    Some(user) => info!(user = %user.short(), "Owner set"),
                    None => info!("Owner cleared"),
                }
                self.owner = owner;
                let _ = reply.send(Ok(()));
            }

            NodeCommand::SyncNow { reply } => {
                let _ = reply.send(self.sync_round("manual").await);
            }

            NodeCommand::SyncMeta { reply } => {
                let _ = reply.send(self.db.load_or_init_sync_meta().map_err(Into::into));
            }

            NodeCommand::Shutdown => {}
        }
    }

    fn owner(&self) -> Result<UserId> {
        self.owner
            .ok_or_else(|| NodeError::Policy("no authenticated owner".into()))
    }

    fn own_post(&self, content_id: &ContentId) -> Result<Record> {
        let owner = self.owner()?;
        let record = self
            .db
            .get_record(content_id)?
            .filter(|r| r.kind == EntityType::Post)
            .ok_or_else(|| NodeError::NotFound(content_id.clone()))?;
        if record.owner_id != owner {
            return Err(NodeError::Policy(format!(
                "post {content_id} belongs to another user"
            )));
        }
        Ok(record)
    }

    fn create_post(&mut self, payload: serde_json::Value) -> Result<Record> {
        let owner = self.owner()?;
        let record = Record::new(ContentId::local(), EntityType::Post, owner, payload);
        self.db.upsert_record(&record, Origin::Local)?;
        let stored = self
            .db
            .get_record(&record.content_id)?
            .ok_or_else(|| NodeError::NotFound(record.content_id.clone()))?;

        info!(content = %stored.content_id, "Post created");
        self.emit(NodeEvent::RecordChanged {
            content_id: stored.content_id.clone(),
            kind: EntityType::Post,
            remote: false,
        });
        Ok(stored)
    }

    fn update_post(&mut self, content_id: &ContentId, payload: serde_json::Value) -> Result<Record> {
        let mut record = self.own_post(content_id)?;
        record.payload = payload;
        self.db.upsert_record(&record, Origin::Local)?;
        let stored = self
            .db
            .get_record(&record.content_id)?
            .ok_or_else(|| NodeError::NotFound(record.content_id.clone()))?;

        debug!(content = %stored.content_id, "Post updated");
        self.emit(NodeEvent::RecordChanged {
            content_id: stored.content_id.clone(),
            kind: EntityType::Post,
            remote: false,
        });
        Ok(stored)
    }

    fn delete_post(&mut self, content_id: &ContentId) -> Result<Record> {
        let record = self.own_post(content_id)?;
        let deleted = self.db.soft_delete_record(&record.content_id)?;

        info!(content = %deleted.content_id, "Post deleted");
        self.emit(NodeEvent::RecordChanged {
            content_id: deleted.content_id.clone(),
            kind: EntityType::Post,
            remote: false,
        });
        Ok(deleted)
    }

    async fn pin(&mut self, content_id: &ContentId, kind: PinKind) -> Result<PinEntry> {
        let owner = self.owner()?;
        let entry = PinEntry {
            content_id: content_id.clone(),
            pin_kind: kind,
            device_scope: decide_scope(kind, self.device_class, &self.roster),
            created_at: Utc::now(),
        };
        let record = Record::new(
            pin_record_id(content_id),
            EntityType::Pin,
            owner,
            serde_json::to_value(&entry)?,
        );
        self.db.upsert_record(&record, Origin::Local)?;

        if entry.covers(self.device_class) {
            self.reflect_pin(content_id, true).await;
        }

        info!(
            content = %content_id,
            kind = %kind,
            scope = ?entry.device_scope,
            "Content pinned"
        );
        self.emit(NodeEvent::RecordChanged {
            content_id: record.content_id,
            kind: EntityType::Pin,
            remote: false,
        });
        Ok(entry)
    }

    async fn unpin(&mut self, content_id: &ContentId) -> Result<()> {
        self.owner()?;
        let record_id = pin_record_id(content_id);
        match self.db.soft_delete_record(&record_id) {
            Ok(_) => {}
            Err(StoreError::NotFound) => return Err(NodeError::NotFound(content_id.clone())),
            Err(e) => return Err(e.into()),
        }
        self.reflect_pin(content_id, false).await;

        info!(content = %content_id, "Content unpinned");
        self.emit(NodeEvent::RecordChanged {
            content_id: record_id,
            kind: EntityType::Pin,
            remote: false,
        });
        Ok(())
    }

    /// Pin bookkeeping is durable before the content store is touched; a
    /// store failure is logged and leaves the pin record in place.
    async fn reflect_pin(&mut self, content_id: &ContentId, pinned: bool) {
        let result = if pinned {
            self.content.pin(content_id).await
        } else {
            self.content.unpin(content_id).await
        };
        if let Err(e) = result {
            warn!(content = %content_id, pinned, error = %e, "Content store pin update failed");
        }
    }

    fn update_profile(
        &mut self,
        display_name: Option<String>,
        bio: Option<String>,
        avatar_id: Option<ContentId>,
    ) -> Result<Profile> {
        let owner = self.owner()?;
        let profile = Profile {
            user_id: owner,
            display_name,
            bio,
            avatar_id,
            updated_at: Utc::now(),
            modified: true,
            synced: false,
        };
        self.db.upsert_profile(&profile, Origin::Local)?;
        let stored = self.db.get_profile(&owner)?.unwrap_or(profile);

        self.emit(NodeEvent::ProfileChanged { user_id: owner });
        Ok(stored)
    }

    fn resolve_conflict(&mut self, content_id: &ContentId, resolution: Resolution) -> Result<Record> {
        let record = match self.db.resolve_conflict(content_id, resolution) {
            Ok(record) => record,
            Err(StoreError::NotFound) => return Err(NodeError::NotFound(content_id.clone())),
            Err(StoreError::NoConflict(id)) => {
                return Err(NodeError::Policy(format!("no pending conflict for {id}")));
            }
            Err(e) => return Err(e.into()),
        };

        self.emit(NodeEvent::ConflictResolved {
            content_id: record.content_id.clone(),
        });
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Peer notifications
    // -----------------------------------------------------------------------

    async fn on_peer_notification(&mut self, note: PeerNotification) {
        match note {
            PeerNotification::Signaling(state) => {
                let status = if state == SignalingState::Ready {
                    NetworkStatus::Online
                } else {
                    NetworkStatus::Offline
                };
                if self.set_network(status) && status == NetworkStatus::Online {
                    self.run_round("network-online").await;
                }
            }

            PeerNotification::StatusChanged(peer) => self.on_peer_status(peer).await,

            PeerNotification::Payload { from, payload } => match SyncMessage::from_value(payload) {
                Ok(SyncMessage::Mutation(envelope)) => self.on_remote_mutation(from, envelope).await,
                Ok(SyncMessage::Ack(ack)) => {
                    if let Err(e) = self.on_ack(&from, &ack) {
                        error!(peer = %from, entry = %ack.entry_id, error = %e, "Failed to apply ack");
                    }
                }
                Err(e) => warn!(peer = %from, error = %e, "Undecodable sync payload"),
            },
        }
    }

    /// Returns `true` if the status changed.
    fn set_network(&mut self, status: NetworkStatus) -> bool {
        if self.network == status {
            return false;
        }
        self.network = status;
        if let Err(e) = self.db.set_network_status(status) {
            error!(error = %e, "Failed to persist network status");
        }
        info!(status = %status, "Network status changed");
        self.emit(NodeEvent::NetworkStatusChanged { status });
        true
    }

    async fn on_peer_status(&mut self, peer: PeerDescriptor) {
        self.emit(NodeEvent::PeerStatusChanged {
            peer_id: peer.peer_id.clone(),
            status: peer.status,
            device_class: peer.device_class,
        });

        match peer.status {
            PeerStatus::Discovered if should_dial(&self.node_id, &peer.peer_id) => {
                let peers = self.peers.clone();
                let id = peer.peer_id;
                tokio::spawn(async move {
                    if !peers.connect(&id).await {
                        debug!(peer = %id, "Connect attempt did not complete");
                    }
                });
            }

            PeerStatus::Connected => {
                if peer.device_class != DeviceClass::Unknown && !self.roster.contains(&peer.device_class) {
                    info!(class = %peer.device_class, "Device class added to roster");
                    self.roster.push(peer.device_class);
                }
                self.run_round("peer-connected").await;
            }

            _ => {}
        }
    }

    async fn on_tick(&mut self) {
        self.run_round("timer").await;
        if let Err(e) = self.db.purge_deleted(self.retention) {
            warn!(error = %e, "Purging deleted records failed");
        }
        if let Err(e) = self.db.prune_applied_entries(self.retention) {
            warn!(error = %e, "Pruning applied entries failed");
        }
    }

    // -----------------------------------------------------------------------
    // Outbound sync
    // -----------------------------------------------------------------------

    /// Unresolved log entries that should be replayed to peers.
    /// `conflict` entries are local bookkeeping and never leave the node.
    fn deliverable(&self) -> Result<Vec<MutationLogEntry>> {
        Ok(self
            .db
            .pending_mutations(None)?
            .into_iter()
            .filter(|e| e.action != MutationAction::Conflict)
            .collect())
    }

    fn envelope(&self, entry: &MutationLogEntry) -> Result<serde_json::Value> {
        let envelope = MutationEnvelope {
            entry_id: entry.id,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            action: entry.action,
            timestamp: entry.timestamp,
            snapshot: entry.payload.clone(),
            origin_node: self.node_id.clone(),
            signer: self.identity.user_id(),
            signature: String::new(),
        }
        .sign(&self.identity)?;
        Ok(SyncMessage::Mutation(envelope).to_value()?)
    }

    async fn run_round(&mut self, trigger: &'static str) {
        if let Err(e) = self.sync_round(trigger).await {
            error!(trigger, error = %e, "Sync round failed");
        }
    }

    async fn sync_round(&mut self, trigger: &'static str) -> Result<SyncReport> {
        if self.network == NetworkStatus::Offline {
            debug!(trigger, "Offline, sync deferred");
            return Ok(SyncReport::default());
        }

        self.db.record_sync_attempt()?;
        let pending = self.deliverable()?;
        let mut report = SyncReport {
            pending: pending.len(),
            ..SyncReport::default()
        };

        if pending.is_empty() {
            self.db.record_sync_success()?;
            debug!(trigger, "Nothing to sync");
            return Ok(report);
        }

        // append order, so per-entity order is preserved on the wire
        for entry in &pending {
            let payload = self.envelope(entry)?;
            let reached = self.peers.broadcast(payload).await;
            if reached > 0 {
                report.delivered += 1;
            }
            report.peers = report.peers.max(reached);
        }
        self.delivered += report.delivered;

        info!(
            trigger,
            pending = report.pending,
            delivered = report.delivered,
            peers = report.peers,
            "Sync round"
        );
        Ok(report)
    }

    /// Push the newest entry of one entity right after a local mutation.
    async fn deliver_latest(&mut self, entity_id: Option<String>) {
        let Some(entity_id) = entity_id else { return };
        if self.network == NetworkStatus::Offline {
            return;
        }

        let entry = match self.db.latest_mutation_for(&entity_id) {
            Ok(Some(entry)) if !entry.conflict_resolved && entry.action != MutationAction::Conflict => entry,
            Ok(_) => return,
            Err(e) => {
                error!(entity = %entity_id, error = %e, "Failed to read mutation log");
                return;
            }
        };

        let payload = match self.envelope(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                error!(entry = %entry.id, error = %e, "Failed to build mutation envelope");
                return;
            }
        };
        let reached = self.peers.broadcast(payload).await;
        if reached > 0 {
            self.delivered += 1;
        }
        debug!(entry = %entry.id, entity = %entity_id, reached, "Mutation pushed");
    }

    fn on_ack(&mut self, from: &NodeId, ack: &AckEnvelope) -> Result<()> {
        let entry = match self.db.get_mutation(ack.entry_id) {
            Ok(entry) => entry,
            Err(StoreError::NotFound) => {
                debug!(peer = %from, entry = %ack.entry_id, "Ack for unknown entry");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !self.db.mark_mutation_resolved(entry.id)? {
            // another peer already acknowledged it
            return Ok(());
        }
        self.acknowledged += 1;
        debug!(peer = %from, entry = %entry.id, entity = %entry.entity_id, "Mutation acknowledged");

        let local_id = ContentId(entry.entity_id.clone());
        if let Some(confirmed) = ack.confirmed_id.as_ref().filter(|c| **c != local_id) {
            self.db.set_alias(confirmed, &local_id)?;
        }

        let outstanding = self
            .db
            .pending_for_entity(&entry.entity_id)?
            .iter()
            .any(|e| e.action != MutationAction::Conflict);
        if !outstanding {
            match entry.entity_type {
                EntityType::Profile => match UserId::from_hex(&entry.entity_id) {
                    Ok(user) => {
                        self.db.mark_profile_synced(&user)?;
                    }
                    Err(e) => warn!(entity = %entry.entity_id, error = %e, "Bad profile entity id"),
                },
                EntityType::Post | EntityType::Pin => {
                    if self.db.mark_record_synced(&local_id)? {
                        self.emit(NodeEvent::RecordSynced { content_id: local_id });
                    }
                }
            }
        }

        if self.deliverable()?.is_empty() {
            self.db.record_sync_success()?;
            info!(
                delivered = self.delivered,
                acknowledged = self.acknowledged,
                "Mutation log drained"
            );
            self.emit(NodeEvent::SyncCompleted {
                delivered: self.delivered,
                acknowledged: self.acknowledged,
            });
            self.delivered = 0;
            self.acknowledged = 0;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound sync
    // -----------------------------------------------------------------------

    async fn on_remote_mutation(&mut self, from: NodeId, envelope: MutationEnvelope) {
        if let Err(e) = envelope.verify() {
            warn!(peer = %from, entry = %envelope.entry_id, error = %e, "Dropping mutation with bad signature");
            return;
        }
        if envelope.origin_node == self.node_id {
            return;
        }

        let ack = match self.apply_remote(&envelope).await {
            Ok(ack) => ack,
            Err(e) => {
                // no ack: the origin keeps the entry pending and retries
                error!(peer = %from, entry = %envelope.entry_id, error = %e, "Failed to apply remote mutation");
                return;
            }
        };

        let payload = match SyncMessage::Ack(ack).to_value() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode ack");
                return;
            }
        };
        if !self.peers.send(&from, payload).await {
            debug!(peer = %from, entry = %envelope.entry_id, "Ack not delivered");
        }
    }

    async fn apply_remote(&mut self, envelope: &MutationEnvelope) -> Result<AckEnvelope> {
        let mut ack = AckEnvelope {
            entry_id: envelope.entry_id,
            content_id: ContentId(envelope.entity_id.clone()),
            confirmed_id: None,
        };

        if self.db.is_entry_applied(envelope.entry_id)? {
            debug!(entry = %envelope.entry_id, "Redelivered entry, acknowledging again");
            ack.confirmed_id = self.confirm_id(envelope)?;
            return Ok(ack);
        }

        match envelope.entity_type {
            EntityType::Profile => {
                let profile: Profile = serde_json::from_value(envelope.snapshot.clone())?;
                let outcome = self.db.upsert_profile(&profile, Origin::Remote)?;
                if outcome != UpsertOutcome::Unchanged {
                    self.emit(NodeEvent::ProfileChanged {
                        user_id: profile.user_id,
                    });
                }
            }

            EntityType::Post | EntityType::Pin => {
                let record: Record = serde_json::from_value(envelope.snapshot.clone())?;
                if record.kind != envelope.entity_type || record.content_id.as_str() != envelope.entity_id {
                    return Err(SharedError::Protocol(format!(
                        "snapshot does not match entity {}",
                        envelope.entity_id
                    ))
                    .into());
                }

                match self.db.upsert_record(&record, Origin::Remote)? {
                    UpsertOutcome::Conflicted => {
                        warn!(content = %record.content_id, "Remote edit conflicts with a local change");
                        self.emit(NodeEvent::ConflictDetected {
                            content_id: record.content_id.clone(),
                        });
                    }
                    UpsertOutcome::Unchanged => {}
                    UpsertOutcome::Inserted | UpsertOutcome::Updated => {
                        if record.kind == EntityType::Pin {
                            self.apply_remote_pin(&record).await;
                        }
                        self.emit(NodeEvent::RecordChanged {
                            content_id: record.content_id.clone(),
                            kind: record.kind,
                            remote: true,
                        });
                    }
                }
            }
        }

        self.db.mark_entry_applied(envelope.entry_id)?;
        ack.confirmed_id = self.confirm_id(envelope)?;
        debug!(entry = %envelope.entry_id, entity = %envelope.entity_id, "Remote mutation applied");
        Ok(ack)
    }

    /// For a post created under a temporary local id, the id this node
    /// confirms it under. Recorded as an alias.
    fn confirm_id(&self, envelope: &MutationEnvelope) -> Result<Option<ContentId>> {
        let local_id = ContentId(envelope.entity_id.clone());
        if envelope.entity_type != EntityType::Post
            || envelope.action != MutationAction::Create
            || !local_id.is_local()
        {
            return Ok(None);
        }

        let payload = envelope
            .snapshot
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let owner = envelope
            .snapshot
            .get("ownerId")
            .cloned()
            .and_then(|v| serde_json::from_value::<UserId>(v).ok())
            .unwrap_or(envelope.signer);
        let confirmed = confirmed_id(&owner, &local_id, &payload)?;
        self.db.set_alias(&confirmed, &local_id)?;
        Ok(Some(confirmed))
    }

    async fn apply_remote_pin(&mut self, record: &Record) {
        let entry: PinEntry = match serde_json::from_value(record.payload.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(content = %record.content_id, error = %e, "Malformed pin entry");
                return;
            }
        };

        if record.deleted {
            self.reflect_pin(&entry.content_id, false).await;
        } else if entry.covers(self.device_class) {
            self.reflect_pin(&entry.content_id, true).await;
        }
    }

    fn emit(&self, event: NodeEvent) {
        emit_event(&self.events, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_records_have_their_own_key() {
        let id = ContentId::from("abc");
        assert_eq!(pin_record_id(&id).as_str(), "pin:abc");
        assert_ne!(pin_record_id(&id), id);
    }

    #[test]
    fn exactly_one_side_dials() {
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        assert!(should_dial(&a, &b));
        assert!(!should_dial(&b, &a));
        assert!(!should_dial(&a, &a));
    }

    #[test]
    fn confirmed_ids_separate_equal_payloads() {
        let payload = serde_json::json!({ "text": "hi" });
        let (alice, bob) = (UserId([1; 32]), UserId([2; 32]));
        let (first, second) = (ContentId::local(), ContentId::local());

        let id = confirmed_id(&alice, &first, &payload).unwrap();
        assert_eq!(id, confirmed_id(&alice, &first, &payload).unwrap());
        assert!(!id.is_local());
        assert_ne!(id, confirmed_id(&bob, &first, &payload).unwrap());
        assert_ne!(id, confirmed_id(&alice, &second, &payload).unwrap());
    }
}
