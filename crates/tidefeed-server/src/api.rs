use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::Method,
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use tidefeed_shared::constants::PROTOCOL_VERSION;

use crate::config::ServerConfig;
use crate::rate_limit::{throttle_upgrades, UpgradeThrottle};
use crate::rendezvous::Rendezvous;
use crate::session::signal_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub rendezvous: Rendezvous,
    pub throttle: UpgradeThrottle,
    pub config: Arc<ServerConfig>,
    pub started: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, throttle: UpgradeThrottle) -> Self {
        Self {
            rendezvous: Rendezvous::new(config.max_peers),
            throttle,
            config: Arc::new(config),
            started: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let signaling = Router::new()
        .route("/signal", get(signal_upgrade))
        .route_layer(middleware::from_fn_with_state(
            state.throttle.clone(),
            throttle_upgrades,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .merge(signaling)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    peers: usize,
    max_peers: usize,
    uptime_secs: u64,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        peers: state.rendezvous.len().await,
        max_peers: state.config.max_peers,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tower::ServiceExt;
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    use tidefeed_shared::protocol::SignalMessage;
    use tidefeed_shared::types::{DeviceClass, NodeId, UserId};

    use super::*;
    use crate::rate_limit::Quota;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const OWNER: UserId = UserId([4u8; 32]);

    async fn start(config: ServerConfig, quota: Quota) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(AppState::new(config, UpgradeThrottle::new(quota)));
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn start_default() -> SocketAddr {
        start(ServerConfig::default(), Quota::default()).await
    }

    async fn send(ws: &mut Client, msg: &SignalMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    /// Next signaling message; `None` if the server closed the socket.
    async fn recv(ws: &mut Client) -> Option<SignalMessage> {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for the server");
        match next {
            Some(Ok(Message::Text(text))) => Some(SignalMessage::from_json(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => None,
            Some(Ok(other)) => panic!("unexpected frame {other:?}"),
        }
    }

    async fn register(addr: SocketAddr, id: &str) -> Client {
        let (mut ws, _) = connect_async(format!("ws://{addr}/signal")).await.unwrap();
        send(
            &mut ws,
            &SignalMessage::Register {
                node_id: NodeId::from(id),
                device_class: DeviceClass::Pc,
                device_name: format!("{id}-box"),
                user_id: Some(OWNER),
            },
        )
        .await;
        ws
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_and_info() {
        let config = ServerConfig {
            instance_name: "test-rv".into(),
            max_peers: 7,
            ..ServerConfig::default()
        };
        let app = build_router(AppState::new(config, UpgradeThrottle::default()));

        let health = get_json(app.clone(), "/health").await;
        assert_eq!(health["status"], "ok");

        let info = get_json(app, "/info").await;
        assert_eq!(info["name"], "test-rv");
        assert_eq!(info["protocol"], PROTOCOL_VERSION);
        assert_eq!(info["peers"], 0);
        assert_eq!(info["max_peers"], 7);
    }

    #[tokio::test]
    async fn two_nodes_meet_and_relay() {
        let addr = start_default().await;

        let mut a = register(addr, "a").await;
        assert_eq!(recv(&mut a).await, Some(SignalMessage::Peers { peers: vec![] }));

        let mut b = register(addr, "b").await;
        match recv(&mut b).await {
            Some(SignalMessage::Peers { peers }) => assert_eq!(peers[0].id, NodeId::from("a")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            recv(&mut a).await,
            Some(SignalMessage::PeerConnected { peer_id, .. }) if peer_id == NodeId::from("b")
        ));

        send(
            &mut b,
            &SignalMessage::Data {
                target_peer_id: NodeId::from("a"),
                user_id: Some(OWNER),
                data: serde_json::json!({"hello": "a"}),
                from_peer_id: None,
            },
        )
        .await;
        match recv(&mut a).await {
            Some(SignalMessage::Data {
                from_peer_id, data, ..
            }) => {
                assert_eq!(from_peer_id, Some(NodeId::from("b")));
                assert_eq!(data["hello"], "a");
            }
            other => panic!("unexpected {other:?}"),
        }

        send(&mut a, &SignalMessage::Ping).await;
        assert_eq!(recv(&mut a).await, Some(SignalMessage::Pong));

        b.close(None).await.unwrap();
        assert!(matches!(
            recv(&mut a).await,
            Some(SignalMessage::PeerDisconnected { peer_id, .. }) if peer_id == NodeId::from("b")
        ));
    }

    #[tokio::test]
    async fn first_message_must_be_register() {
        let addr = start_default().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/signal")).await.unwrap();
        send(&mut ws, &SignalMessage::Ping).await;
        assert_eq!(recv(&mut ws).await, None);
    }

    #[tokio::test]
    async fn silent_node_is_dropped_after_pong_timeout() {
        let config = ServerConfig {
            heartbeat_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        let addr = start(config, Quota::default()).await;

        let mut a = register(addr, "a").await;
        assert!(matches!(recv(&mut a).await, Some(SignalMessage::Peers { .. })));
        assert_eq!(recv(&mut a).await, Some(SignalMessage::Ping));
        // never answer; the server gives up
        loop {
            match recv(&mut a).await {
                Some(SignalMessage::Ping) => continue,
                None => break,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn full_server_refuses_upgrade() {
        let config = ServerConfig {
            max_peers: 1,
            ..ServerConfig::default()
        };
        let addr = start(config, Quota::default()).await;

        let mut a = register(addr, "a").await;
        assert!(matches!(recv(&mut a).await, Some(SignalMessage::Peers { .. })));
        assert!(connect_async(format!("ws://{addr}/signal")).await.is_err());
    }

    #[tokio::test]
    async fn upgrades_are_throttled() {
        let quota = Quota {
            per_second: 0.0,
            burst: 1.0,
        };
        let addr = start(ServerConfig::default(), quota).await;

        assert!(connect_async(format!("ws://{addr}/signal")).await.is_ok());
        assert!(connect_async(format!("ws://{addr}/signal")).await.is_err());
    }
}
