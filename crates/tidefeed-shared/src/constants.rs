use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "tidefeed";

/// Protocol version advertised in the signaling registration
pub const PROTOCOL_VERSION: &str = "/tidefeed/1.0.0";

/// Prefix of temporary ids assigned to locally created records
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Default signaling endpoint (rendezvous server WebSocket route)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/signal";

/// Default HTTP port of the rendezvous server
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Bounded wait for a peer data channel to open
pub const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Bounded wait for the signaling socket handshake
pub const SIGNALING_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff: first delay
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Reconnect backoff: ceiling
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Interval between client heartbeat pings
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// How long a ping may stay unanswered before the channel is considered dead
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between peer-list refresh requests
pub const DISCOVERY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval of the orchestrator's sync timer
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Soft-deleted records older than this are purged even if never acknowledged
pub const DEFAULT_DELETE_RETENTION_DAYS: i64 = 30;

/// Maximum content blob size in bytes (50 MiB)
pub const MAX_CONTENT_SIZE: usize = 50 * 1024 * 1024;
