mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use common::{eventually, spawn_node, Hub, NodeOptions, TestNode, OWNER};
use tidefeed_node::{confirmed_id, pin_record_id, NodeError, NodeEvent};
use tidefeed_shared::types::{ContentId, DeviceClass, EntityType, MutationAction, NetworkStatus, PeerStatus, PinKind};
use tidefeed_store::Resolution;

async fn is_synced(node: &TestNode, id: &ContentId) -> bool {
    matches!(node.handle.get_record(id).await, Ok(Some(r)) if r.synced && !r.modified)
}

async fn connected(node: &TestNode, peer: &TestNode) -> bool {
    node.handle
        .peers()
        .await
        .iter()
        .any(|p| p.peer_id == peer.id && p.status == PeerStatus::Connected)
}

async fn bring_online(hub: &Hub, a: &TestNode, b: &TestNode) {
    hub.set_online(&a.id, true).await;
    hub.set_online(&b.id, true).await;
    assert!(eventually(|| async { connected(a, b).await && connected(b, a).await }).await);
}

#[tokio::test]
async fn offline_post_is_pending() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let a = spawn_node(&hub, dir.path(), NodeOptions::new(DeviceClass::Pc)).await;

    let post = a.handle.create_post(json!({ "text": "P1" })).await.unwrap();
    assert!(post.content_id.is_local());

    let stored = a.handle.get_record(&post.content_id).await.unwrap().unwrap();
    assert!(!stored.synced);
    assert!(stored.modified);

    let pending = a.handle.pending_mutations(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, MutationAction::Create);
    assert_eq!(pending[0].entity_id, post.content_id.as_str());

    let meta = a.handle.sync_meta().await.unwrap();
    assert_eq!(meta.network_status, NetworkStatus::Offline);
    assert_eq!(meta.device_id, a.id);
}

#[tokio::test]
async fn delivery_after_reconnect_marks_synced() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let hub = Hub::new();
    let a = spawn_node(&hub, dir_a.path(), NodeOptions::new(DeviceClass::Pc)).await;
    let b = spawn_node(&hub, dir_b.path(), NodeOptions::new(DeviceClass::Mobile)).await;

    let post = a.handle.create_post(json!({ "text": "P1" })).await.unwrap();
    bring_online(&hub, &a, &b).await;

    assert!(eventually(|| is_synced(&a, &post.content_id)).await);
    assert!(a.handle.pending_mutations(None).await.unwrap().is_empty());

    let replica = b.handle.get_record(&post.content_id).await.unwrap().unwrap();
    assert_eq!(replica.payload, json!({ "text": "P1" }));
    assert_eq!(replica.owner_id, OWNER);
    assert!(replica.synced);

    // the confirmed id resolves to the same record on both sides
    let confirmed = confirmed_id(&OWNER, &post.content_id, &json!({ "text": "P1" })).unwrap();
    assert!(eventually(|| async {
        matches!(a.handle.get_record(&confirmed).await, Ok(Some(r)) if r.content_id == post.content_id)
    })
    .await);
    let via_alias = b.handle.get_record(&confirmed).await.unwrap().unwrap();
    assert_eq!(via_alias.content_id, post.content_id);

    let meta = a.handle.sync_meta().await.unwrap();
    assert_eq!(meta.network_status, NetworkStatus::Online);
    assert!(meta.last_successful_sync_at.is_some());
}

#[tokio::test]
async fn concurrent_edits_conflict_then_keep_remote() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let hub = Hub::new();
    let a = spawn_node(&hub, dir_a.path(), NodeOptions::new(DeviceClass::Pc)).await;
    let b = spawn_node(&hub, dir_b.path(), NodeOptions::new(DeviceClass::Mobile)).await;

    bring_online(&hub, &a, &b).await;
    let post = a.handle.create_post(json!({ "text": "v0" })).await.unwrap();
    let id = post.content_id.clone();
    assert!(eventually(|| is_synced(&a, &id)).await);
    assert!(eventually(|| is_synced(&b, &id)).await);

    hub.set_online(&a.id, false).await;
    hub.set_online(&b.id, false).await;
    a.handle.update_post(&id, json!({ "text": "from A" })).await.unwrap();
    b.handle.update_post(&id, json!({ "text": "from B" })).await.unwrap();

    bring_online(&hub, &a, &b).await;
    assert!(eventually(|| async {
        matches!(b.handle.get_record(&id).await, Ok(Some(r)) if r.has_conflict())
    })
    .await);

    let on_b = b.handle.get_record(&id).await.unwrap().unwrap();
    assert_eq!(on_b.payload, json!({ "text": "from B" }));
    assert!(on_b.modified);
    let candidate = on_b.conflict.as_ref().unwrap();
    assert_eq!(candidate.remote_version.payload, json!({ "text": "from A" }));

    let resolved = b.handle.resolve_conflict(&id, Resolution::KeepRemote).await.unwrap();
    assert_eq!(resolved.payload, json!({ "text": "from A" }));
    assert!(resolved.conflict.is_none());

    let stored = b.handle.get_record(&id).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!({ "text": "from A" }));
    assert!(stored.conflict.is_none());
    assert!(b
        .handle
        .pending_mutations(None)
        .await
        .unwrap()
        .iter()
        .all(|e| e.entity_id != id.as_str()));

    // nothing left to resolve
    assert!(matches!(
        b.handle.resolve_conflict(&id, Resolution::KeepLocal).await,
        Err(NodeError::Policy(_))
    ));
}

#[tokio::test]
async fn amplified_pins_reach_every_device_class() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let hub = Hub::new();
    let roster = vec![DeviceClass::Pc, DeviceClass::Mobile];
    let a = spawn_node(
        &hub,
        dir_a.path(),
        NodeOptions {
            roster: roster.clone(),
            ..NodeOptions::new(DeviceClass::Pc)
        },
    )
    .await;
    let b = spawn_node(
        &hub,
        dir_b.path(),
        NodeOptions {
            roster,
            ..NodeOptions::new(DeviceClass::Mobile)
        },
    )
    .await;

    let loved = a.handle.put_content(b"loved".to_vec()).await.unwrap();
    let liked = a.handle.put_content(b"liked".to_vec()).await.unwrap();

    let entry = a.handle.pin(&loved, PinKind::Amplified).await.unwrap();
    assert_eq!(
        entry.device_scope,
        BTreeSet::from([DeviceClass::Pc, DeviceClass::Mobile])
    );
    let entry = a.handle.pin(&liked, PinKind::Standard).await.unwrap();
    assert_eq!(entry.device_scope, BTreeSet::from([DeviceClass::Pc]));

    let mut pinned = a.handle.list_pinned().await.unwrap();
    pinned.sort();
    let mut expected = vec![loved.clone(), liked.clone()];
    expected.sort();
    assert_eq!(pinned, expected);

    bring_online(&hub, &a, &b).await;
    assert!(eventually(|| async {
        matches!(b.handle.get_record(&pin_record_id(&liked)).await, Ok(Some(_)))
            && matches!(b.handle.get_record(&pin_record_id(&loved)).await, Ok(Some(_)))
    })
    .await);
    assert_eq!(b.handle.list_pinned().await.unwrap(), vec![loved.clone()]);

    // unpin propagates as a delete
    a.handle.unpin(&loved).await.unwrap();
    assert!(eventually(|| async { b.handle.list_pinned().await.unwrap().is_empty() }).await);
    assert!(b.handle.get_record(&pin_record_id(&loved)).await.unwrap().is_none());
}

#[tokio::test]
async fn local_mutations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let a = spawn_node(&hub, dir.path(), NodeOptions::new(DeviceClass::Pc)).await;
    let first_id = a.id.clone();

    let post = a.handle.create_post(json!({ "text": "durable" })).await.unwrap();
    a.handle
        .update_profile(Some("Ada".into()), None, None)
        .await
        .unwrap();
    a.handle.shutdown().await;
    assert!(eventually(|| async { a.handle.sync_meta().await.is_err() }).await);

    let a = spawn_node(&hub, dir.path(), NodeOptions::new(DeviceClass::Pc)).await;
    assert_eq!(a.id, first_id);

    let stored = a.handle.get_record(&post.content_id).await.unwrap().unwrap();
    assert!(stored.modified);
    assert!(!stored.synced);

    let pending = a.handle.pending_mutations(None).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].entity_type, EntityType::Post);
    assert_eq!(pending[1].entity_type, EntityType::Profile);

    let profile = a.handle.get_profile(&OWNER).await.unwrap().unwrap();
    assert_eq!(profile.display_name.as_deref(), Some("Ada"));
}

#[tokio::test]
async fn redelivered_mutations_are_not_applied_twice() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let hub = Hub::new();
    let a = spawn_node(&hub, dir_a.path(), NodeOptions::new(DeviceClass::Pc)).await;
    let b = spawn_node(&hub, dir_b.path(), NodeOptions::new(DeviceClass::Mobile)).await;

    bring_online(&hub, &a, &b).await;
    let post = a.handle.create_post(json!({ "text": "once" })).await.unwrap();
    assert!(eventually(|| is_synced(&a, &post.content_id)).await);

    // b edits and syncs, then the original create is replayed to it
    b.handle
        .update_post(&post.content_id, json!({ "text": "edited on b" }))
        .await
        .unwrap();
    assert!(eventually(|| is_synced(&b, &post.content_id)).await);

    assert!(hub.replay(&b.id).await > 0);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let feed = b.handle.list_feed(false).await.unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].payload, json!({ "text": "edited on b" }));
    assert!(!feed[0].has_conflict());
    assert!(b.handle.pending_mutations(None).await.unwrap().is_empty());
    assert!(a.handle.pending_mutations(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn profiles_replicate() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let hub = Hub::new();
    let a = spawn_node(&hub, dir_a.path(), NodeOptions::new(DeviceClass::Pc)).await;
    let b = spawn_node(&hub, dir_b.path(), NodeOptions::new(DeviceClass::Server)).await;
    bring_online(&hub, &a, &b).await;

    a.handle
        .update_profile(Some("Ada".into()), Some("hello".into()), None)
        .await
        .unwrap();

    assert!(eventually(|| async {
        matches!(b.handle.get_profile(&OWNER).await, Ok(Some(p)) if p.bio.as_deref() == Some("hello"))
    })
    .await);
    assert!(eventually(|| async {
        matches!(a.handle.get_profile(&OWNER).await, Ok(Some(p)) if p.synced && !p.modified)
    })
    .await);
}

#[tokio::test]
async fn pinning_and_posting_require_an_owner() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new();
    let a = spawn_node(
        &hub,
        dir.path(),
        NodeOptions {
            owner: None,
            ..NodeOptions::new(DeviceClass::Pc)
        },
    )
    .await;

    assert!(matches!(
        a.handle.pin(&ContentId::from("abc"), PinKind::Standard).await,
        Err(NodeError::Policy(_))
    ));
    assert!(matches!(
        a.handle.create_post(json!({})).await,
        Err(NodeError::Policy(_))
    ));
    assert!(a.handle.pending_mutations(None).await.unwrap().is_empty());

    a.handle.set_owner(Some(OWNER)).await.unwrap();
    a.handle.pin(&ContentId::from("abc"), PinKind::Standard).await.unwrap();
    assert_eq!(a.handle.pending_mutations(Some(EntityType::Pin)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn events_follow_local_and_network_changes() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let hub = Hub::new();
    let a = spawn_node(&hub, dir_a.path(), NodeOptions::new(DeviceClass::Pc)).await;
    let b = spawn_node(&hub, dir_b.path(), NodeOptions::new(DeviceClass::Mobile)).await;
    let mut events = a.handle.subscribe();

    let post = a.handle.create_post(json!({ "text": "hi" })).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        NodeEvent::RecordChanged {
            content_id: post.content_id.clone(),
            kind: EntityType::Post,
            remote: false,
        }
    );

    bring_online(&hub, &a, &b).await;

    let mut saw_online = false;
    let mut saw_synced = false;
    let collected = tokio::time::timeout(Duration::from_secs(5), async {
        while !(saw_online && saw_synced) {
            match events.recv().await.unwrap() {
                NodeEvent::NetworkStatusChanged { status } => saw_online |= status == NetworkStatus::Online,
                NodeEvent::RecordSynced { content_id } => saw_synced |= content_id == post.content_id,
                _ => {}
            }
        }
    })
    .await;
    assert!(collected.is_ok());
}
