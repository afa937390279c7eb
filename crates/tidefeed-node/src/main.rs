//! # tidefeed-node
//!
//! Daemon running the sync engine for one device: local database, content
//! store, signaling channel to the rendezvous server and the peer manager,
//! all driven by the sync orchestrator until Ctrl+C.

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tidefeed_net::{spawn_peer_manager, spawn_signaling, PeerManagerConfig, SignalingConfig};
use tidefeed_shared::Identity;
use tidefeed_store::Database;

use tidefeed_node::{spawn_orchestrator, FsContentStore, NodeConfig, NodeParts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tidefeed_node=debug,tidefeed_net=debug,tidefeed_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("Starting tidefeed node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");
    std::fs::create_dir_all(&config.data_dir)?;

    // -----------------------------------------------------------------------
    // 3. Local state
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path())?;
    let identity = Identity::load_or_create(&config.identity_path())?;
    let owner = config.user_id.unwrap_or_else(|| identity.user_id());
    let node_id = db.load_or_init_sync_meta()?.device_id;

    info!(node = %node_id, owner = %owner.short(), "Node identity loaded");

    let content = FsContentStore::open(config.content_dir(), config.max_content_size).await?;

    // -----------------------------------------------------------------------
    // 4. Networking
    // -----------------------------------------------------------------------
    let mut signaling_config =
        SignalingConfig::new(node_id.clone(), config.device_class, config.device_name.clone());
    signaling_config.url = config.signaling_url.clone();
    signaling_config.user_id = Some(owner);
    let (signaling, signal_events) = spawn_signaling(signaling_config);

    let mut peer_config = PeerManagerConfig::new(node_id, config.device_class, config.device_name.clone());
    peer_config.user_id = Some(owner);
    let (peers, notifications) = spawn_peer_manager(peer_config, signaling.sender(), signal_events);

    // -----------------------------------------------------------------------
    // 5. Orchestrator
    // -----------------------------------------------------------------------
    let node = spawn_orchestrator(NodeParts {
        db,
        identity,
        owner: Some(owner),
        device_class: config.device_class,
        roster: config.roster.clone(),
        peers,
        notifications,
        content,
        sync_interval: config.sync_interval,
        retention: config.delete_retention(),
    })?;

    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "Node event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(url = %config.signaling_url, "Node running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    node.shutdown().await;
    signaling.close();

    Ok(())
}
