//! Peer connection manager.
//!
//! Owns the [`PeerTable`] and drives the per-peer state machine
//! `discovered -> connecting -> connected -> disconnected` on top of the
//! signaling channel, which also relays peer data.
//!
//! The manager runs in a dedicated tokio task. External code talks to it
//! through a cloneable [`PeerHandle`] and receives [`PeerNotification`]s on
//! an mpsc channel, mirroring the command/notification split of the
//! signaling task. All transitions are computed by [`PeerState`], a plain
//! struct whose handlers return effects instead of performing I/O.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tidefeed_shared::constants::{DISCOVERY_REFRESH_INTERVAL, PEER_CONNECT_TIMEOUT};
use tidefeed_shared::protocol::{PeerFrame, SignalMessage};
use tidefeed_shared::types::{DeviceClass, NodeId, PeerStatus, UserId};

use crate::peers::{PeerDescriptor, PeerTable};
use crate::signaling::{SignalingEvent, SignalingState};

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub node_id: NodeId,
    pub device_class: DeviceClass,
    pub device_name: String,
    pub user_id: Option<UserId>,
    pub connect_timeout: Duration,
    pub refresh_interval: Duration,
}

impl PeerManagerConfig {
    pub fn new(node_id: NodeId, device_class: DeviceClass, device_name: impl Into<String>) -> Self {
        Self {
            node_id,
            device_class,
            device_name: device_name.into(),
            user_id: None,
            connect_timeout: PEER_CONNECT_TIMEOUT,
            refresh_interval: DISCOVERY_REFRESH_INTERVAL,
        }
    }
}

/// Notifications sent *from* the manager task.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerNotification {
    /// The signaling channel changed state.
    Signaling(SignalingState),
    /// A peer moved to a new status; carries the updated descriptor.
    StatusChanged(PeerDescriptor),
    /// Application payload from a connected peer.
    Payload {
        from: NodeId,
        payload: serde_json::Value,
    },
}

/// Commands sent *into* the manager task.
#[derive(Debug)]
enum PeerCommand {
    Connect {
        peer: NodeId,
        reply: oneshot::Sender<bool>,
    },
    Disconnect(NodeId),
    Send {
        peer: NodeId,
        payload: serde_json::Value,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        payload: serde_json::Value,
        reply: oneshot::Sender<usize>,
    },
    Peers(oneshot::Sender<Vec<PeerDescriptor>>),
    Shutdown,
}

/// Cloneable handle to the manager task.
///
/// Every method absorbs transport failures: a dead manager looks like a
/// manager with no connected peers.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<PeerCommand>,
}

impl PeerHandle {
    /// Resolves `true` once the peer's channel is open, `false` on timeout
    /// or failure. A timed-out peer is back to `discovered`.
    pub async fn connect(&self, peer: &NodeId) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = PeerCommand::Connect {
            peer: peer.clone(),
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn disconnect(&self, peer: &NodeId) {
        let _ = self.tx.send(PeerCommand::Disconnect(peer.clone())).await;
    }

    /// `false` if the peer is not `connected`.
    pub async fn send(&self, peer: &NodeId, payload: serde_json::Value) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = PeerCommand::Send {
            peer: peer.clone(),
            payload,
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Best-effort send to every connected peer. Returns how many sends succeeded.
    pub async fn broadcast(&self, payload: serde_json::Value) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PeerCommand::Broadcast { payload, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PeerCommand::Peers(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(PeerCommand::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Pure state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    Signal(SignalMessage),
    Notify(PeerNotification),
    /// Settle every pending `connect` for this peer.
    ConnectResolved { peer: NodeId, connected: bool },
    /// Start the connect timer for a peer that entered `connecting`, unless
    /// one is already running.
    ArmDeadline(NodeId),
}

pub(crate) struct PeerState {
    config: PeerManagerConfig,
    table: PeerTable,
    signaling: SignalingState,
}

impl PeerState {
    pub(crate) fn new(config: PeerManagerConfig) -> Self {
        Self {
            config,
            table: PeerTable::new(),
            signaling: SignalingState::Initializing,
        }
    }

    fn data(&self, target: &NodeId, frame: &PeerFrame) -> Option<SignalMessage> {
        let data = match serde_json::to_value(frame) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode peer frame");
                return None;
            }
        };
        Some(SignalMessage::Data {
            target_peer_id: target.clone(),
            user_id: self.config.user_id,
            data,
            from_peer_id: None,
        })
    }

    /// Our `peer-info` for `peer`, at most once per connection.
    fn send_info(&mut self, peer: &NodeId) -> Option<Effect> {
        let descriptor = self.table.get_mut(peer)?;
        if descriptor.info_sent {
            return None;
        }
        descriptor.info_sent = true;

        let frame = PeerFrame::PeerInfo {
            display_name: self.config.device_name.clone(),
            device_type: self.config.device_class,
        };
        self.data(peer, &frame).map(Effect::Signal)
    }

    fn transition(&mut self, peer: &NodeId, status: PeerStatus, effects: &mut Vec<Effect>) {
        if self.table.set_status(peer, status).is_some() {
            if let Some(descriptor) = self.table.get(peer) {
                effects.push(Effect::Notify(PeerNotification::StatusChanged(
                    descriptor.clone(),
                )));
            }
        }
    }

    fn drop_peer(&mut self, peer: &NodeId, effects: &mut Vec<Effect>) {
        self.transition(peer, PeerStatus::Disconnected, effects);
        effects.push(Effect::ConnectResolved {
            peer: peer.clone(),
            connected: false,
        });
    }

    pub(crate) fn on_event(&mut self, event: SignalingEvent) -> Vec<Effect> {
        match event {
            SignalingEvent::StateChanged(state) => {
                self.signaling = state;
                let mut effects = vec![Effect::Notify(PeerNotification::Signaling(state))];
                if state != SignalingState::Ready {
                    // peer data rides on the signaling connection
                    for peer in self.table.active_peers() {
                        self.drop_peer(&peer, &mut effects);
                    }
                }
                effects
            }
            SignalingEvent::Message(msg) => self.on_signal(msg),
        }
    }

    pub(crate) fn on_signal(&mut self, msg: SignalMessage) -> Vec<Effect> {
        let mut effects = Vec::new();
        let local = self.config.node_id.clone();

        match msg {
            SignalMessage::Peers { peers } => {
                let before: HashMap<NodeId, Option<PeerStatus>> = peers
                    .iter()
                    .map(|s| (s.id.clone(), self.table.status(&s.id)))
                    .collect();
                self.table.merge_snapshot(&local, &peers);
                for summary in peers.iter().filter(|s| s.id != local) {
                    let now = self.table.get(&summary.id);
                    if now.map(|d| Some(d.status)) != before.get(&summary.id).cloned() {
                        if let Some(descriptor) = now {
                            effects.push(Effect::Notify(PeerNotification::StatusChanged(
                                descriptor.clone(),
                            )));
                        }
                    }
                }
            }

            SignalMessage::PeerConnected {
                peer_id,
                device_class,
                device_name,
            } if peer_id != local => {
                let before = self.table.status(&peer_id);
                let descriptor =
                    self.table
                        .on_discovered(&peer_id, device_class, device_name, None);
                if before != Some(descriptor.status) {
                    effects.push(Effect::Notify(PeerNotification::StatusChanged(
                        descriptor.clone(),
                    )));
                }
            }

            SignalMessage::PeerDisconnected { peer_id, .. } => {
                if self.table.get(&peer_id).is_some() {
                    self.drop_peer(&peer_id, &mut effects);
                }
            }

            SignalMessage::Connect {
                from_peer_id: Some(from),
                ..
            } => {
                // incoming connections are accepted unconditionally
                let descriptor = self.table.entry(&from);
                descriptor.last_seen_at = chrono::Utc::now();
                descriptor.info_sent = false;
                if descriptor.status != PeerStatus::Connected {
                    self.transition(&from, PeerStatus::Connecting, &mut effects);
                    // the dialer's peer-info may never arrive
                    effects.push(Effect::ArmDeadline(from.clone()));
                }
                effects.extend(self.send_info(&from));
                info!(peer = %from, "Incoming peer connection");
            }

            SignalMessage::Disconnect {
                from_peer_id: Some(from),
                ..
            } => {
                if self.table.get(&from).is_some() {
                    self.drop_peer(&from, &mut effects);
                }
            }

            SignalMessage::Data {
                from_peer_id: Some(from),
                data,
                ..
            }
            | SignalMessage::Broadcast {
                from_peer_id: Some(from),
                data,
                ..
            } => self.on_frame(from, data, &mut effects),

            other => debug!(kind = other.kind(), "Ignoring signaling message"),
        }

        effects
    }

    fn on_frame(&mut self, from: NodeId, data: serde_json::Value, effects: &mut Vec<Effect>) {
        let frame = match serde_json::from_value::<PeerFrame>(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %from, error = %e, "Dropping malformed peer frame");
                return;
            }
        };

        match frame {
            PeerFrame::PeerInfo {
                display_name,
                device_type,
            } => {
                let descriptor = self.table.entry(&from);
                descriptor.display_name = Some(display_name);
                descriptor.device_class = device_type;
                descriptor.last_seen_at = chrono::Utc::now();

                effects.extend(self.send_info(&from));
                if !self.table.is_connected(&from) {
                    self.transition(&from, PeerStatus::Connected, effects);
                    info!(peer = %from, class = %device_type, "Peer connected");
                }
                effects.push(Effect::ConnectResolved {
                    peer: from,
                    connected: true,
                });
            }

            PeerFrame::App { payload } => {
                if !self.table.is_connected(&from) {
                    debug!(peer = %from, "Dropping payload from unconnected peer");
                    return;
                }
                if let Some(descriptor) = self.table.get_mut(&from) {
                    descriptor.last_seen_at = chrono::Utc::now();
                }
                effects.push(Effect::Notify(PeerNotification::Payload { from, payload }));
            }
        }
    }

    pub(crate) fn begin_connect(&mut self, peer: &NodeId) -> Vec<Effect> {
        let mut effects = Vec::new();
        let resolved = |connected| Effect::ConnectResolved {
            peer: peer.clone(),
            connected,
        };

        if peer == &self.config.node_id || self.signaling != SignalingState::Ready {
            effects.push(resolved(false));
            return effects;
        }

        match self.table.status(peer) {
            Some(PeerStatus::Connected) => effects.push(resolved(true)),
            Some(PeerStatus::Connecting) => effects.push(Effect::ArmDeadline(peer.clone())),
            _ => {
                self.table.entry(peer).info_sent = false;
                self.transition(peer, PeerStatus::Connecting, &mut effects);
                effects.push(Effect::ArmDeadline(peer.clone()));
                effects.push(Effect::Signal(SignalMessage::Connect {
                    target_peer_id: peer.clone(),
                    user_id: self.config.user_id,
                    from_peer_id: None,
                }));
                effects.extend(self.send_info(peer));
                debug!(peer = %peer, "Connecting to peer");
            }
        }
        effects
    }

    pub(crate) fn connect_timed_out(&mut self, peer: &NodeId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.table.status(peer) == Some(PeerStatus::Connecting) {
            warn!(peer = %peer, "Peer connect timed out");
            self.transition(peer, PeerStatus::Discovered, &mut effects);
            effects.push(Effect::ConnectResolved {
                peer: peer.clone(),
                connected: false,
            });
        }
        effects
    }

    pub(crate) fn disconnect(&mut self, peer: &NodeId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.table.get(peer).is_some_and(|d| d.is_active()) {
            effects.push(Effect::Signal(SignalMessage::Disconnect {
                target_peer_id: peer.clone(),
                user_id: self.config.user_id,
                from_peer_id: None,
            }));
            self.drop_peer(peer, &mut effects);
        }
        effects
    }

    /// Relay envelope for an application payload, if `peer` is connected.
    pub(crate) fn app_message(&self, peer: &NodeId, payload: serde_json::Value) -> Option<SignalMessage> {
        if !self.table.is_connected(peer) {
            return None;
        }
        self.data(peer, &PeerFrame::App { payload })
    }

    pub(crate) fn table(&self) -> &PeerTable {
        &self.table
    }

    pub(crate) fn signaling(&self) -> SignalingState {
        self.signaling
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Spawn the peer manager.
///
/// * `signal_tx` - outbound messages for the signaling channel
/// * `events` - the signaling channel's event stream
pub fn spawn_peer_manager(
    config: PeerManagerConfig,
    signal_tx: mpsc::Sender<SignalMessage>,
    events: mpsc::Receiver<SignalingEvent>,
) -> (PeerHandle, mpsc::Receiver<PeerNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<PeerCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<PeerNotification>(256);

    tokio::spawn(async move {
        let mut task = ManagerTask {
            connect_timeout: config.connect_timeout,
            refresh_interval: config.refresh_interval,
            state: PeerState::new(config),
            signal_tx,
            notif_tx,
            waiters: HashMap::new(),
            deadlines: HashMap::new(),
        };
        task.run(cmd_rx, events).await;
        info!("Peer manager terminated");
    });

    (PeerHandle { tx: cmd_tx }, notif_rx)
}

struct ManagerTask {
    state: PeerState,
    connect_timeout: Duration,
    refresh_interval: Duration,
    signal_tx: mpsc::Sender<SignalMessage>,
    notif_tx: mpsc::Sender<PeerNotification>,
    waiters: HashMap<NodeId, Vec<oneshot::Sender<bool>>>,
    deadlines: HashMap<NodeId, Instant>,
}

impl ManagerTask {
    async fn run(
        &mut self,
        mut cmd_rx: mpsc::Receiver<PeerCommand>,
        mut events: mpsc::Receiver<SignalingEvent>,
    ) {
        let mut refresh = tokio::time::interval_at(
            Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );

        loop {
            let next_deadline = self.deadlines.values().min().copied();
            let timer = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::Shutdown) | None => {
                            info!("Peer manager shutdown requested");
                            break;
                        }
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(event) => {
                            let effects = self.state.on_event(event);
                            self.apply(effects).await;
                        }
                        None => {
                            info!("Signaling stream ended");
                            break;
                        }
                    }
                }

                _ = timer => {
                    let now = Instant::now();
                    let expired: Vec<NodeId> = self
                        .deadlines
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(peer, _)| peer.clone())
                        .collect();
                    for peer in expired {
                        self.deadlines.remove(&peer);
                        let effects = self.state.connect_timed_out(&peer);
                        self.apply(effects).await;
                    }
                }

                _ = refresh.tick() => {
                    if self.state.signaling() == SignalingState::Ready {
                        debug!("Requesting peer list refresh");
                        self.signal(SignalMessage::Peers { peers: Vec::new() }).await;
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::Connect { peer, reply } => {
                self.waiters.entry(peer.clone()).or_default().push(reply);
                let effects = self.state.begin_connect(&peer);
                self.apply(effects).await;
            }
            PeerCommand::Disconnect(peer) => {
                let effects = self.state.disconnect(&peer);
                self.apply(effects).await;
            }
            PeerCommand::Send {
                peer,
                payload,
                reply,
            } => {
                let sent = match self.state.app_message(&peer, payload) {
                    Some(msg) => self.signal(msg).await,
                    None => false,
                };
                let _ = reply.send(sent);
            }
            PeerCommand::Broadcast { payload, reply } => {
                let mut delivered = 0;
                for peer in self.state.table().connected_peers() {
                    let Some(msg) = self.state.app_message(&peer, payload.clone()) else {
                        continue;
                    };
                    if self.signal(msg).await {
                        delivered += 1;
                    }
                }
                let _ = reply.send(delivered);
            }
            PeerCommand::Peers(reply) => {
                let _ = reply.send(self.state.table().snapshot());
            }
            PeerCommand::Shutdown => {}
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Signal(msg) => {
                    self.signal(msg).await;
                }
                Effect::Notify(notification) => {
                    let _ = self.notif_tx.send(notification).await;
                }
                Effect::ConnectResolved { peer, connected } => {
                    self.deadlines.remove(&peer);
                    for waiter in self.waiters.remove(&peer).unwrap_or_default() {
                        let _ = waiter.send(connected);
                    }
                }
                Effect::ArmDeadline(peer) => {
                    let deadline = Instant::now() + self.connect_timeout;
                    self.deadlines.entry(peer).or_insert(deadline);
                }
            }
        }
    }

    async fn signal(&self, msg: SignalMessage) -> bool {
        match self.signal_tx.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = e.0.kind(), "Signaling channel closed, message dropped");
                false
            }
        }
    }
}
