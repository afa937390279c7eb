//! Presence registry and relay.
//!
//! Nodes are grouped by the owner id they register with; a node only ever
//! sees, and can only address, the other nodes of its own group. The
//! registry never inspects `data`/`broadcast` payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tidefeed_shared::protocol::{PeerSummary, SignalMessage};
use tidefeed_shared::types::{DeviceClass, NodeId, UserId};

use crate::error::ServerError;

/// Outbound queue depth per socket. A client that falls this far behind
/// loses messages rather than stalling the registry.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Identifies one socket's registration. A node that reconnects gets a
/// fresh session; the stale socket's cleanup then leaves the new one alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(u64);

/// What a node announces in its `register` message.
#[derive(Debug, Clone)]
pub struct Registration {
    pub node_id: NodeId,
    pub device_class: DeviceClass,
    pub device_name: String,
    pub user_id: Option<UserId>,
}

struct Member {
    session: SessionId,
    device_class: DeviceClass,
    device_name: String,
    user_id: Option<UserId>,
    tx: mpsc::Sender<SignalMessage>,
    last_seen: DateTime<Utc>,
}

impl Member {
    fn summary(&self, id: &NodeId) -> PeerSummary {
        PeerSummary {
            id: id.clone(),
            device_name: Some(self.device_name.clone()),
            device_class: self.device_class,
            last_seen: Some(self.last_seen),
        }
    }

    fn push(&self, id: &NodeId, msg: SignalMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(node = %id, kind = msg.kind(), "Outbound queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct Registry {
    members: HashMap<NodeId, Member>,
}

impl Registry {
    fn group<'a>(
        &'a self,
        user: Option<UserId>,
        except: &'a NodeId,
    ) -> impl Iterator<Item = (&'a NodeId, &'a Member)> + 'a {
        self.members
            .iter()
            .filter(move |(id, m)| *id != except && m.user_id == user)
    }
}

#[derive(Clone)]
pub struct Rendezvous {
    registry: Arc<Mutex<Registry>>,
    sessions: Arc<AtomicU64>,
    max_peers: usize,
}

impl Rendezvous {
    /// `max_peers == 0` means no cap.
    pub fn new(max_peers: usize) -> Self {
        Self {
            registry: Arc::default(),
            sessions: Arc::new(AtomicU64::new(1)),
            max_peers,
        }
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.members.len()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Add a node, push it the current snapshot of its group and announce
    /// it to the rest of the group. A node id that is already present is
    /// taken over by the new socket.
    pub async fn register(
        &self,
        reg: Registration,
        tx: mpsc::Sender<SignalMessage>,
    ) -> Result<SessionId, ServerError> {
        let mut registry = self.registry.lock().await;

        let takeover = registry.members.contains_key(&reg.node_id);
        if !takeover && self.max_peers > 0 && registry.members.len() >= self.max_peers {
            return Err(ServerError::Full {
                max: self.max_peers,
            });
        }

        let session = SessionId(self.sessions.fetch_add(1, Ordering::Relaxed));
        let member = Member {
            session,
            device_class: reg.device_class,
            device_name: reg.device_name,
            user_id: reg.user_id,
            tx,
            last_seen: Utc::now(),
        };

        let peers = registry
            .group(reg.user_id, &reg.node_id)
            .map(|(id, m)| m.summary(id))
            .collect();
        member.push(&reg.node_id, SignalMessage::Peers { peers });

        for (id, other) in registry.group(reg.user_id, &reg.node_id) {
            other.push(
                id,
                SignalMessage::PeerConnected {
                    peer_id: reg.node_id.clone(),
                    device_class: Some(member.device_class),
                    device_name: Some(member.device_name.clone()),
                },
            );
        }

        info!(
            node = %reg.node_id,
            class = %member.device_class,
            takeover,
            "Node registered"
        );
        registry.members.insert(reg.node_id, member);
        Ok(session)
    }

    /// Remove a node if `session` is still its current registration.
    pub async fn unregister(&self, node_id: &NodeId, session: SessionId) -> bool {
        let mut registry = self.registry.lock().await;
        if !registry
            .members
            .get(node_id)
            .is_some_and(|m| m.session == session)
        {
            return false;
        }
        let Some(gone) = registry.members.remove(node_id) else {
            return false;
        };

        for (id, other) in registry.group(gone.user_id, node_id) {
            other.push(
                id,
                SignalMessage::PeerDisconnected {
                    peer_id: node_id.clone(),
                    device_class: Some(gone.device_class),
                    device_name: Some(gone.device_name.clone()),
                },
            );
        }
        info!(node = %node_id, "Node unregistered");
        true
    }

    pub async fn touch(&self, node_id: &NodeId) {
        if let Some(m) = self.registry.lock().await.members.get_mut(node_id) {
            m.last_seen = Utc::now();
        }
    }

    /// The nodes `node_id` can currently see.
    pub async fn snapshot(&self, node_id: &NodeId) -> Vec<PeerSummary> {
        let registry = self.registry.lock().await;
        let Some(me) = registry.members.get(node_id) else {
            return Vec::new();
        };
        registry
            .group(me.user_id, node_id)
            .map(|(id, m)| m.summary(id))
            .collect()
    }

    /// Forward a relay envelope from `from`. Point-to-point kinds are
    /// delivered to their target with `fromPeerId` stamped; `broadcast`
    /// goes to every other node of the group. Returns the number of
    /// recipients reached.
    pub async fn relay(&self, from: &NodeId, msg: SignalMessage) -> usize {
        let registry = self.registry.lock().await;
        let Some(sender) = registry.members.get(from) else {
            return 0;
        };
        let group = sender.user_id;

        let (target, stamped) = match msg {
            SignalMessage::Connect {
                target_peer_id,
                user_id,
                ..
            } => (
                target_peer_id.clone(),
                SignalMessage::Connect {
                    target_peer_id,
                    user_id,
                    from_peer_id: Some(from.clone()),
                },
            ),
            SignalMessage::Disconnect {
                target_peer_id,
                user_id,
                ..
            } => (
                target_peer_id.clone(),
                SignalMessage::Disconnect {
                    target_peer_id,
                    user_id,
                    from_peer_id: Some(from.clone()),
                },
            ),
            SignalMessage::Data {
                target_peer_id,
                user_id,
                data,
                ..
            } => (
                target_peer_id.clone(),
                SignalMessage::Data {
                    target_peer_id,
                    user_id,
                    data,
                    from_peer_id: Some(from.clone()),
                },
            ),
            SignalMessage::Broadcast { user_id, data, .. } => {
                let reached = registry
                    .group(group, from)
                    .filter(|(id, m)| {
                        m.push(
                            id,
                            SignalMessage::Broadcast {
                                user_id,
                                data: data.clone(),
                                from_peer_id: Some(from.clone()),
                            },
                        )
                    })
                    .count();
                debug!(from = %from, reached, "Broadcast relayed");
                return reached;
            }
            other => {
                debug!(from = %from, kind = other.kind(), "Not a relay envelope");
                return 0;
            }
        };

        match registry.members.get(&target) {
            Some(m) if m.user_id == group => {
                let kind = stamped.kind();
                let ok = m.push(&target, stamped);
                debug!(from = %from, to = %target, kind, ok, "Relayed");
                usize::from(ok)
            }
            _ => {
                debug!(from = %from, to = %target, "Relay target unknown");
                0
            }
        }
    }
}
