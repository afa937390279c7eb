//! # tidefeed-server
//!
//! Rendezvous service for tidefeed nodes.
//!
//! This binary provides:
//! - **Signaling** over WebSocket (`/signal`): presence per owner, peer
//!   snapshots and join/leave announcements, relay of connection setup and
//!   data envelopes between a user's devices
//! - **Heartbeat** pings so dead sockets are dropped promptly
//! - **REST API** (axum) for health checks and instance info
//! - **Per-IP throttling** of signaling upgrades

mod api;
mod config;
mod error;
mod rate_limit;
mod rendezvous;
mod session;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::UpgradeThrottle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tidefeed_server=debug")),
        )
        .init();

    info!("Starting tidefeed rendezvous server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let throttle = UpgradeThrottle::default();
    let http_addr = config.http_addr;
    let app_state = AppState::new(config, throttle.clone());

    // Forget throttled clients idle for ten minutes, every five
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let dropped = throttle.forget_idle(Duration::from_secs(600)).await;
            if dropped > 0 {
                tracing::debug!(dropped, "Purged idle throttle entries");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 4. Run the HTTP + signaling server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
