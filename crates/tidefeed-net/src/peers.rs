//! Peer table.
//!
//! Maintains an in-memory map of known peers, their device metadata and
//! connection status. Only the peer manager task mutates it; everyone else
//! gets snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use tidefeed_shared::protocol::PeerSummary;
use tidefeed_shared::types::{DeviceClass, NodeId, PeerStatus};

/// What we know about one remote peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub peer_id: NodeId,
    pub display_name: Option<String>,
    pub device_class: DeviceClass,
    pub status: PeerStatus,
    pub last_seen_at: DateTime<Utc>,
    /// Our `peer-info` frame has gone out on the current connection.
    #[serde(skip)]
    pub info_sent: bool,
}

impl PeerDescriptor {
    pub fn new(peer_id: NodeId) -> Self {
        Self {
            peer_id,
            display_name: None,
            device_class: DeviceClass::Unknown,
            status: PeerStatus::Discovered,
            last_seen_at: Utc::now(),
            info_sent: false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, PeerStatus::Connecting | PeerStatus::Connected)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: HashMap<NodeId, PeerDescriptor>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &NodeId) -> Option<&PeerDescriptor> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &NodeId) -> Option<&mut PeerDescriptor> {
        self.peers.get_mut(peer_id)
    }

    /// Return the entry for `peer_id`, inserting a fresh `discovered` one if unknown.
    pub fn entry(&mut self, peer_id: &NodeId) -> &mut PeerDescriptor {
        self.peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerDescriptor::new(peer_id.clone()))
    }

    /// Record a peer announced by the rendezvous server.
    ///
    /// A disconnected peer becomes discoverable again; an active one keeps its status.
    pub fn on_discovered(
        &mut self,
        peer_id: &NodeId,
        device_class: Option<DeviceClass>,
        device_name: Option<String>,
        last_seen: Option<DateTime<Utc>>,
    ) -> &PeerDescriptor {
        let peer = self.entry(peer_id);
        if let Some(class) = device_class.filter(|c| *c != DeviceClass::Unknown) {
            peer.device_class = class;
        }
        if device_name.is_some() {
            peer.display_name = device_name;
        }
        peer.last_seen_at = last_seen.unwrap_or_else(Utc::now);
        if peer.status == PeerStatus::Disconnected {
            peer.status = PeerStatus::Discovered;
        }
        peer
    }

    /// Merge a full snapshot from the rendezvous server.
    ///
    /// Idle peers missing from the snapshot are dropped. Connecting and
    /// connected peers are never evicted by a refresh. Returns the ids of
    /// peers that were not known before.
    pub fn merge_snapshot(&mut self, local: &NodeId, snapshot: &[PeerSummary]) -> Vec<NodeId> {
        let mut fresh = Vec::new();
        for summary in snapshot.iter().filter(|s| &s.id != local) {
            let known = self.peers.contains_key(&summary.id);
            self.on_discovered(
                &summary.id,
                Some(summary.device_class),
                summary.device_name.clone(),
                summary.last_seen,
            );
            if !known {
                fresh.push(summary.id.clone());
            }
        }

        self.peers.retain(|id, peer| {
            let keep = peer.is_active() || snapshot.iter().any(|s| &s.id == id);
            if !keep {
                debug!(peer = %id, "Evicting stale peer after refresh");
            }
            keep
        });

        fresh
    }

    /// Move a peer to `status`. Returns the previous status if it changed.
    pub fn set_status(&mut self, peer_id: &NodeId, status: PeerStatus) -> Option<PeerStatus> {
        let peer = self.peers.get_mut(peer_id)?;
        if peer.status == status {
            return None;
        }
        let previous = peer.status;
        peer.status = status;
        if !peer.is_active() {
            peer.info_sent = false;
        }
        debug!(peer = %peer_id, from = %previous, to = %status, "Peer status changed");
        Some(previous)
    }

    pub fn status(&self, peer_id: &NodeId) -> Option<PeerStatus> {
        self.peers.get(peer_id).map(|p| p.status)
    }

    pub fn is_connected(&self, peer_id: &NodeId) -> bool {
        self.status(peer_id) == Some(PeerStatus::Connected)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self
            .peers
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .map(|p| p.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Peers currently connecting or connected.
    pub fn active_peers(&self) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| p.is_active())
            .map(|p| p.peer_id.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Snapshot of all descriptors, ordered by id.
    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        let mut all: Vec<_> = self.peers.values().cloned().collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }
}
