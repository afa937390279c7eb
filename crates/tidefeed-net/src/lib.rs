// Peer networking for tidefeed: a persistent signaling channel to the
// rendezvous server and the peer connection manager built on top of it.

pub mod error;
pub mod manager;
pub mod peers;
pub mod reconnect;
pub mod signaling;

pub use error::{NetError, Result};
pub use manager::{spawn_peer_manager, PeerHandle, PeerManagerConfig, PeerNotification};
pub use peers::{PeerDescriptor, PeerTable};
pub use reconnect::reconnect_backoff;
pub use signaling::{
    spawn_signaling, SignalingConfig, SignalingEvent, SignalingHandle, SignalingState,
};
