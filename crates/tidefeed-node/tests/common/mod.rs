#![allow(dead_code)]

//! In-memory stand-in for the rendezvous server.
//!
//! Each test node gets a real peer manager and a real orchestrator; only
//! the WebSocket is replaced by channels routed through [`Hub`].

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use tidefeed_net::{spawn_peer_manager, PeerManagerConfig, SignalingEvent, SignalingState};
use tidefeed_node::{spawn_orchestrator, MemoryContentStore, NodeHandle, NodeParts};
use tidefeed_shared::protocol::{PeerSummary, SignalMessage};
use tidefeed_shared::types::{DeviceClass, NodeId, UserId};
use tidefeed_shared::Identity;
use tidefeed_store::Database;

pub const OWNER: UserId = UserId([9u8; 32]);

struct HubNode {
    events: mpsc::Sender<SignalingEvent>,
    class: DeviceClass,
    online: bool,
    /// Relay envelopes delivered to this node, for replay.
    received: Vec<SignalMessage>,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<NodeId, HubNode>,
}

impl HubState {
    fn is_online(&self, id: &NodeId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.online)
    }

    fn deliver(&mut self, target: &NodeId, msg: SignalMessage) {
        let Some(node) = self.nodes.get_mut(target).filter(|n| n.online) else {
            return;
        };
        if matches!(msg, SignalMessage::Data { .. } | SignalMessage::Broadcast { .. }) {
            node.received.push(msg.clone());
        }
        let _ = node.events.try_send(SignalingEvent::Message(msg));
    }

    fn snapshot_for(&self, id: &NodeId) -> Vec<PeerSummary> {
        self.nodes
            .iter()
            .filter(|(peer, node)| *peer != id && node.online)
            .map(|(peer, node)| PeerSummary {
                id: peer.clone(),
                device_name: Some(format!("{}-test", node.class)),
                device_class: node.class,
                last_seen: None,
            })
            .collect()
    }

    fn others_online(&self, id: &NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(peer, node)| *peer != id && node.online)
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's signaling channels. The node starts offline.
    async fn attach(
        &self,
        id: NodeId,
        class: DeviceClass,
        mut outbound: mpsc::Receiver<SignalMessage>,
        events: mpsc::Sender<SignalingEvent>,
    ) {
        self.state.lock().await.nodes.insert(
            id.clone(),
            HubNode {
                events,
                class,
                online: false,
                received: Vec::new(),
            },
        );

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                route(&state, &id, msg).await;
            }
        });
    }

    /// Bring a node's signaling channel up or down.
    pub async fn set_online(&self, id: &NodeId, online: bool) {
        let mut st = self.state.lock().await;
        let Some(node) = st.nodes.get_mut(id) else {
            return;
        };
        if node.online == online {
            return;
        }
        node.online = online;
        let class = node.class;
        let state = if online {
            SignalingState::Ready
        } else {
            SignalingState::Error
        };
        let _ = node.events.try_send(SignalingEvent::StateChanged(state));

        if online {
            let peers = st.snapshot_for(id);
            st.deliver(id, SignalMessage::Peers { peers });
        }

        for other in st.others_online(id) {
            let msg = if online {
                SignalMessage::PeerConnected {
                    peer_id: id.clone(),
                    device_class: Some(class),
                    device_name: Some(format!("{class}-test")),
                }
            } else {
                SignalMessage::PeerDisconnected {
                    peer_id: id.clone(),
                    device_class: Some(class),
                    device_name: None,
                }
            };
            st.deliver(&other, msg);
        }
    }

    /// Deliver again every relay envelope `id` has received so far.
    pub async fn replay(&self, id: &NodeId) -> usize {
        let mut st = self.state.lock().await;
        let Some(node) = st.nodes.get(id) else {
            return 0;
        };
        let again = node.received.clone();
        let count = again.len();
        for msg in again {
            st.deliver(id, msg);
        }
        count
    }
}

async fn route(state: &Arc<Mutex<HubState>>, from: &NodeId, msg: SignalMessage) {
    let mut st = state.lock().await;
    if !st.is_online(from) {
        return;
    }

    match msg {
        SignalMessage::Connect {
            target_peer_id,
            user_id,
            ..
        } => st.deliver(
            &target_peer_id.clone(),
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
        } => st.deliver(
            &target_peer_id.clone(),
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
        } => st.deliver(
            &target_peer_id.clone(),
            SignalMessage::Data {
                target_peer_id,
                user_id,
                data,
                from_peer_id: Some(from.clone()),
            },
        ),
        SignalMessage::Broadcast { user_id, data, .. } => {
            for other in st.others_online(from) {
                st.deliver(
                    &other,
                    SignalMessage::Broadcast {
                        user_id,
                        data: data.clone(),
                        from_peer_id: Some(from.clone()),
                    },
                );
            }
        }
        SignalMessage::Peers { .. } => {
            let peers = st.snapshot_for(from);
            st.deliver(from, SignalMessage::Peers { peers });
        }
        _ => {}
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub handle: NodeHandle,
    pub content: MemoryContentStore,
}

pub struct NodeOptions {
    pub class: DeviceClass,
    pub roster: Vec<DeviceClass>,
    pub owner: Option<UserId>,
}

impl NodeOptions {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            roster: vec![class],
            owner: Some(OWNER),
        }
    }
}

/// Start a node whose state lives in `dir`. Reusing `dir` simulates a restart.
pub async fn spawn_node(hub: &Hub, dir: &Path, opts: NodeOptions) -> TestNode {
    let db = Database::open_at(&dir.join("tidefeed.db")).unwrap();
    let identity = Identity::load_or_create(&dir.join("node.key")).unwrap();
    let id = db.load_or_init_sync_meta().unwrap().device_id;

    let (signal_tx, signal_rx) = mpsc::channel(1024);
    let (event_tx, event_rx) = mpsc::channel(1024);
    let mut config = PeerManagerConfig::new(id.clone(), opts.class, format!("{}-test", opts.class));
    config.connect_timeout = Duration::from_secs(2);
    let (peers, notifications) = spawn_peer_manager(config, signal_tx, event_rx);
    hub.attach(id.clone(), opts.class, signal_rx, event_tx).await;

    let content = MemoryContentStore::new();
    let handle = spawn_orchestrator(NodeParts {
        db,
        identity,
        owner: opts.owner,
        device_class: opts.class,
        roster: opts.roster,
        peers,
        notifications,
        content: content.clone(),
        sync_interval: Duration::from_secs(3600),
        retention: chrono::Duration::days(30),
    })
    .unwrap();

    TestNode { id, handle, content }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
