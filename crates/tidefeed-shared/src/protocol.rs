//! Wire formats.
//!
//! Three layers travel over the signaling connection:
//! - [`SignalMessage`]: JSON objects exchanged with the rendezvous server,
//!   discriminated by `type`.
//! - [`PeerFrame`]: the payload of a relayed `data` envelope once two peers
//!   talk to each other (handshake metadata or an opaque application payload).
//! - [`SyncMessage`]: the application payload the sync orchestrator puts
//!   inside `PeerFrame::App`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SharedError;
use crate::identity::{verify_hex, Identity};
use crate::types::{ContentId, DeviceClass, EntityType, MutationAction, NodeId, UserId};

/// One entry of a `peers` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: NodeId,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "unknown_class")]
    pub device_class: DeviceClass,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn unknown_class() -> DeviceClass {
    DeviceClass::Unknown
}

/// Control messages exchanged with the signaling intermediary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// client -> server, once per connection
    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        node_id: NodeId,
        device_class: DeviceClass,
        device_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },

    /// server -> client, full snapshot; client -> server with an empty list requests a refresh
    #[serde(rename = "peers")]
    Peers { peers: Vec<PeerSummary> },

    #[serde(rename = "peerConnected", rename_all = "camelCase")]
    PeerConnected {
        peer_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_class: Option<DeviceClass>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },

    #[serde(rename = "peerDisconnected", rename_all = "camelCase")]
    PeerDisconnected {
        peer_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_class: Option<DeviceClass>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },

    /// Connection request relayed to `target_peer_id`; the server stamps `from_peer_id`.
    #[serde(rename = "connect", rename_all = "camelCase")]
    Connect {
        target_peer_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<NodeId>,
    },

    #[serde(rename = "disconnect", rename_all = "camelCase")]
    Disconnect {
        target_peer_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<NodeId>,
    },

    /// Point-to-point relay envelope.
    #[serde(rename = "data", rename_all = "camelCase")]
    Data {
        target_peer_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<NodeId>,
    },

    /// Fan-out envelope.
    #[serde(rename = "broadcast", rename_all = "camelCase")]
    Broadcast {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<NodeId>,
    },

    #[serde(rename = "PING")]
    Ping,

    #[serde(rename = "PONG")]
    Pong,
}

impl SignalMessage {
    pub fn to_json(&self) -> Result<String, SharedError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SharedError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The `type` discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Peers { .. } => "peers",
            Self::PeerConnected { .. } => "peerConnected",
            Self::PeerDisconnected { .. } => "peerDisconnected",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Data { .. } => "data",
            Self::Broadcast { .. } => "broadcast",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

/// Payloads carried peer-to-peer inside a `data` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PeerFrame {
    /// Device metadata, exchanged once per new connection.
    #[serde(rename = "peer-info", rename_all = "camelCase")]
    PeerInfo {
        display_name: String,
        device_type: DeviceClass,
    },

    /// Application payload, opaque to the transport.
    #[serde(rename = "app")]
    App { payload: serde_json::Value },
}

/// A replicated local mutation, signed by the node that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationEnvelope {
    pub entry_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: MutationAction,
    pub timestamp: DateTime<Utc>,
    /// Snapshot of the entity after the mutation.
    pub snapshot: serde_json::Value,
    pub origin_node: NodeId,
    pub signer: UserId,
    #[serde(default)]
    pub signature: String,
}

impl MutationEnvelope {
    /// Canonical bytes covered by the signature (the envelope with an empty signature).
    pub fn signing_bytes(&self) -> Result<Vec<u8>, SharedError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn sign(mut self, identity: &Identity) -> Result<Self, SharedError> {
        self.signer = identity.user_id();
        self.signature = identity.sign_hex(&self.signing_bytes()?);
        Ok(self)
    }

    pub fn verify(&self) -> Result<(), SharedError> {
        verify_hex(&self.signer, &self.signing_bytes()?, &self.signature)?;
        Ok(())
    }
}

/// Application-level acknowledgement of one delivered mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AckEnvelope {
    pub entry_id: Uuid,
    pub content_id: ContentId,
    /// Set when the receiver knows the record under a different, confirmed id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_id: Option<ContentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SyncMessage {
    #[serde(rename = "mutation")]
    Mutation(MutationEnvelope),

    #[serde(rename = "ack")]
    Ack(AckEnvelope),
}

impl SyncMessage {
    pub fn to_value(&self) -> Result<serde_json::Value, SharedError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, SharedError> {
        Ok(serde_json::from_value(value)?)
    }
}
