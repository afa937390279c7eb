//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::time::Duration;

use tidefeed_shared::constants::{DEFAULT_HTTP_PORT, HEARTBEAT_INTERVAL, PONG_TIMEOUT, SIGNALING_HANDSHAKE_TIMEOUT};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Maximum number of concurrently registered nodes (0 = unlimited).
    /// Env: `MAX_PEERS`
    pub max_peers: usize,

    /// Interval between server pings on each signaling socket.
    /// Env: `HEARTBEAT_INTERVAL_SECS`
    pub heartbeat_interval: Duration,

    /// A socket that leaves a ping unanswered this long is dropped.
    /// Env: `PONG_TIMEOUT_SECS`
    pub pong_timeout: Duration,

    /// Time a new socket has to send `register`.
    pub register_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "tidefeed rendezvous".to_string(),
            max_peers: 0,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
            register_timeout: SIGNALING_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(val) = lookup("MAX_PEERS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_peers = n;
            }
        }

        if let Some(secs) = lookup("HEARTBEAT_INTERVAL_SECS").and_then(|v| parse_secs(&v)) {
            config.heartbeat_interval = secs;
        }

        if let Some(secs) = lookup("PONG_TIMEOUT_SECS").and_then(|v| parse_secs(&v)) {
            config.pong_timeout = secs;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_secs(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(value = %value, "Invalid duration in seconds, using default");
            None
        }
    }
}
