//! One signaling socket.
//!
//! The first text message must be `register`. After that the socket runs a
//! select loop over inbound messages, the registry's outbound queue for
//! this node, a heartbeat ticker and the pong deadline.

use std::future;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, info, warn};

use tidefeed_shared::protocol::SignalMessage;
use tidefeed_shared::types::NodeId;

use crate::api::AppState;
use crate::error::ServerError;
use crate::rendezvous::{Registration, OUTBOUND_CAPACITY};

pub async fn signal_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let max = state.rendezvous.max_peers();
    if max > 0 && state.rendezvous.len().await >= max {
        warn!(max, "Refusing signaling upgrade, server full");
        return Err(ServerError::Full { max });
    }
    Ok(ws.on_upgrade(move |socket| run(socket, state)))
}

/// Next signaling message, skipping frames that are not JSON text.
/// `None` once the socket is closed or broken.
async fn next_signal<S>(stream: &mut S) -> Option<SignalMessage>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                Ok(msg) => return Some(msg),
                Err(e) => debug!(error = %e, "Ignoring malformed signaling message"),
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Signaling socket error");
                return None;
            }
        }
    }
    None
}

async fn run(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Registration handshake
    let first = tokio::time::timeout(state.config.register_timeout, next_signal(&mut stream)).await;
    let reg = match first {
        Ok(Some(SignalMessage::Register {
            node_id,
            device_class,
            device_name,
            user_id,
        })) => Registration {
            node_id,
            device_class,
            device_name,
            user_id,
        },
        Ok(Some(other)) => {
            let err = ServerError::Protocol(format!("expected register, got {}", other.kind()));
            warn!(error = %err, "Rejecting signaling socket");
            let _ = sink.send(Message::Close(Some(err.close_frame()))).await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            debug!("No registration within timeout, closing");
            return;
        }
    };

    let node_id = reg.node_id.clone();
    let (tx, mut outbound) = mpsc::channel(OUTBOUND_CAPACITY);
    let session = match state.rendezvous.register(reg, tx).await {
        Ok(session) => session,
        Err(err) => {
            warn!(node = %node_id, error = %err, "Registration refused");
            let _ = sink.send(Message::Close(Some(err.close_frame()))).await;
            return;
        }
    };

    let heartbeat = state.config.heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_wait = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            inbound = next_signal(&mut stream) => {
                let Some(msg) = inbound else { break };
                state.rendezvous.touch(&node_id).await;

                let reply = match msg {
                    SignalMessage::Ping => Some(SignalMessage::Pong),
                    SignalMessage::Pong => {
                        pong_deadline = None;
                        None
                    }
                    SignalMessage::Peers { .. } => Some(SignalMessage::Peers {
                        peers: state.rendezvous.snapshot(&node_id).await,
                    }),
                    msg @ (SignalMessage::Connect { .. }
                    | SignalMessage::Disconnect { .. }
                    | SignalMessage::Data { .. }
                    | SignalMessage::Broadcast { .. }) => {
                        state.rendezvous.relay(&node_id, msg).await;
                        None
                    }
                    other => {
                        debug!(node = %node_id, kind = other.kind(), "Ignoring message");
                        None
                    }
                };

                if let Some(reply) = reply {
                    if !send(&mut sink, &node_id, &reply).await {
                        break;
                    }
                }
            }

            queued = outbound.recv() => {
                // The sender is dropped when another socket takes this node id over.
                let Some(msg) = queued else {
                    info!(node = %node_id, "Session superseded");
                    break;
                };
                if !send(&mut sink, &node_id, &msg).await {
                    break;
                }
            }

            _ = ticker.tick() => {
                if !send(&mut sink, &node_id, &SignalMessage::Ping).await {
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + state.config.pong_timeout);
                }
            }

            _ = pong_wait => {
                warn!(node = %node_id, "Heartbeat unanswered, dropping node");
                break;
            }
        }
    }

    state.rendezvous.unregister(&node_id, session).await;
    let _ = sink.close().await;
}

async fn send<S>(sink: &mut S, node_id: &NodeId, msg: &SignalMessage) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let text = match msg.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(node = %node_id, error = %e, "Failed to encode signaling message");
            return true;
        }
    };
    if sink.send(Message::Text(text)).await.is_err() {
        debug!(node = %node_id, "Signaling socket closed while sending");
        return false;
    }
    true
}
