use serde::Serialize;
use tokio::sync::broadcast;

use tidefeed_shared::types::{ContentId, DeviceClass, EntityType, NetworkStatus, NodeId, PeerStatus, UserId};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State changes pushed to whoever drives the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NodeEvent {
    #[serde(rename_all = "camelCase")]
    RecordChanged {
        content_id: ContentId,
        kind: EntityType,
        remote: bool,
    },

    #[serde(rename_all = "camelCase")]
    RecordSynced { content_id: ContentId },

    #[serde(rename_all = "camelCase")]
    ConflictDetected { content_id: ContentId },

    #[serde(rename_all = "camelCase")]
    ConflictResolved { content_id: ContentId },

    #[serde(rename_all = "camelCase")]
    ProfileChanged { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    PeerStatusChanged {
        peer_id: NodeId,
        status: PeerStatus,
        device_class: DeviceClass,
    },

    #[serde(rename_all = "camelCase")]
    NetworkStatusChanged { status: NetworkStatus },

    #[serde(rename_all = "camelCase")]
    SyncCompleted { delivered: usize, acknowledged: usize },
}

pub fn emit_event(tx: &broadcast::Sender<NodeEvent>, event: NodeEvent) {
    // no subscribers is not an error
    if tx.receiver_count() == 0 {
        return;
    }
    if let Err(e) = tx.send(event) {
        tracing::error!(error = %e, "Failed to emit event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_tag() {
        let json = serde_json::to_value(NodeEvent::SyncCompleted {
            delivered: 2,
            acknowledged: 1,
        })
        .unwrap();
        assert_eq!(json["event"], "sync-completed");
        assert_eq!(json["delivered"], 2);

        let json = serde_json::to_value(NodeEvent::RecordSynced {
            content_id: ContentId::from("abc"),
        })
        .unwrap();
        assert_eq!(json["contentId"], "abc");
    }

    #[tokio::test]
    async fn emit_reaches_subscribers() {
        let (tx, _) = broadcast::channel(4);
        emit_event(&tx, NodeEvent::NetworkStatusChanged { status: NetworkStatus::Online });

        let mut rx = tx.subscribe();
        emit_event(&tx, NodeEvent::NetworkStatusChanged { status: NetworkStatus::Offline });
        assert_eq!(
            rx.recv().await.unwrap(),
            NodeEvent::NetworkStatusChanged { status: NetworkStatus::Offline }
        );
    }
}
