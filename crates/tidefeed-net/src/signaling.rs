//! Persistent control connection to the rendezvous server.
//!
//! The channel runs in its own tokio task. It connects over WebSocket, sends
//! `register` once the socket is up, answers server `PING`s, sends its own
//! heartbeat and reconnects with randomized exponential backoff whenever the
//! connection drops unexpectedly. A deliberate [`SignalingHandle::close`]
//! ends the task without reconnecting.
//!
//! Callers see the connection only as state (a [`watch`] channel) and as a
//! stream of [`SignalingEvent`]s; transport errors never escape the task.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tidefeed_shared::constants::{
    BACKOFF_BASE, BACKOFF_MAX, DEFAULT_SIGNALING_URL, HEARTBEAT_INTERVAL, PONG_TIMEOUT,
    SIGNALING_HANDSHAKE_TIMEOUT,
};
use tidefeed_shared::protocol::SignalMessage;
use tidefeed_shared::types::{DeviceClass, NodeId, UserId};

use crate::reconnect::reconnect_backoff;
use crate::error::{NetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Initializing,
    Ready,
    /// The connection dropped or could not be established; a reconnect is scheduled.
    Error,
    /// Closed on purpose. Terminal.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    StateChanged(SignalingState),
    /// A server message other than heartbeat traffic.
    Message(SignalMessage),
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub node_id: NodeId,
    pub device_class: DeviceClass,
    pub device_name: String,
    pub user_id: Option<UserId>,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl SignalingConfig {
    pub fn new(node_id: NodeId, device_class: DeviceClass, device_name: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            node_id,
            device_class,
            device_name: device_name.into(),
            user_id: None,
            handshake_timeout: SIGNALING_HANDSHAKE_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
        }
    }

    fn register_message(&self) -> SignalMessage {
        SignalMessage::Register {
            node_id: self.node_id.clone(),
            device_class: self.device_class,
            device_name: self.device_name.clone(),
            user_id: self.user_id,
        }
    }
}

/// What the session loop does with one inbound server message.
#[derive(Debug, PartialEq)]
pub(crate) enum Dispatch {
    /// Answer on the same connection.
    Reply(SignalMessage),
    /// Liveness proof for our own heartbeat.
    PongReceived,
    /// Hand to the consumer.
    Forward(SignalMessage),
}

pub(crate) fn dispatch(msg: SignalMessage) -> Dispatch {
    match msg {
        SignalMessage::Ping => Dispatch::Reply(SignalMessage::Pong),
        SignalMessage::Pong => Dispatch::PongReceived,
        other => Dispatch::Forward(other),
    }
}

/// Handle to a running signaling task. Dropping every handle closes the channel.
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: mpsc::Sender<SignalMessage>,
    state: watch::Receiver<SignalingState>,
    close: Arc<watch::Sender<bool>>,
}

impl SignalingHandle {
    /// Sender for outbound messages, for the peer manager.
    pub fn sender(&self) -> mpsc::Sender<SignalMessage> {
        self.outbound.clone()
    }

    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    /// Close deliberately. No reconnect follows.
    pub fn close(&self) {
        let _ = self.close.send(true);
    }
}

/// Spawn the signaling task.
///
/// Returns the handle and the event stream. The stream ends when the task does.
pub fn spawn_signaling(config: SignalingConfig) -> (SignalingHandle, mpsc::Receiver<SignalingEvent>) {
    let (outbound_tx, outbound_rx) = mpsc::channel::<SignalMessage>(256);
    let (event_tx, event_rx) = mpsc::channel::<SignalingEvent>(256);
    let (state_tx, state_rx) = watch::channel(SignalingState::Initializing);
    let (close_tx, close_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut task = SignalingTask {
            config,
            outbound: outbound_rx,
            close: close_rx,
            state: state_tx,
            events: event_tx,
        };
        task.run().await;
        info!("Signaling task terminated");
    });

    (
        SignalingHandle {
            outbound: outbound_tx,
            state: state_rx,
            close: Arc::new(close_tx),
        },
        event_rx,
    )
}

enum SessionEnd {
    /// Deliberate close, or every handle dropped.
    Closed,
    /// Unexpected loss; reconnect.
    Dropped(NetError),
}

struct SignalingTask {
    config: SignalingConfig,
    outbound: mpsc::Receiver<SignalMessage>,
    close: watch::Receiver<bool>,
    state: watch::Sender<SignalingState>,
    events: mpsc::Sender<SignalingEvent>,
}

impl SignalingTask {
    async fn run(&mut self) {
        let mut backoff = reconnect_backoff(self.config.backoff_base, self.config.backoff_max);
        let mut attempt = 0u32;

        loop {
            self.set_state(SignalingState::Initializing).await;

            let connect = tokio::time::timeout(
                self.config.handshake_timeout,
                tokio_tungstenite::connect_async(self.config.url.as_str()),
            );
            let end = match connect.await {
                Ok(Ok((ws, _response))) => {
                    backoff.reset();
                    attempt = 0;
                    info!(url = %self.config.url, node = %self.config.node_id, "Signaling connected");
                    self.set_state(SignalingState::Ready).await;
                    self.session(ws).await
                }
                Ok(Err(e)) => SessionEnd::Dropped(NetError::WebSocket(e)),
                Err(_) => SessionEnd::Dropped(NetError::Timeout("signaling handshake")),
            };

            match end {
                SessionEnd::Closed => {
                    self.set_state(SignalingState::Disconnected).await;
                    return;
                }
                SessionEnd::Dropped(e) => {
                    warn!(error = %e, "Signaling connection lost");
                    self.set_state(SignalingState::Error).await;
                }
            }

            attempt += 1;
            let delay = backoff.next_backoff().unwrap_or(self.config.backoff_max);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.close.changed() => {
                    self.set_state(SignalingState::Disconnected).await;
                    return;
                }
            }
        }
    }

    async fn session<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        if let Err(e) = send_json(&mut sink, &self.config.register_message()).await {
            return SessionEnd::Dropped(e);
        }

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let liveness = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.close.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Closed;
                }

                out = self.outbound.recv() => {
                    let Some(msg) = out else {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Closed;
                    };
                    debug!(kind = msg.kind(), "Signaling send");
                    if let Err(e) = send_json(&mut sink, &msg).await {
                        return SessionEnd::Dropped(e);
                    }
                }

                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Dropped(NetError::Closed("closed by server".into()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Dropped(e.into()),
                    };

                    let msg = match SignalMessage::from_json(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(error = %e, "Ignoring unparseable signaling message");
                            continue;
                        }
                    };

                    match dispatch(msg) {
                        Dispatch::Reply(reply) => {
                            if let Err(e) = send_json(&mut sink, &reply).await {
                                return SessionEnd::Dropped(e);
                            }
                        }
                        Dispatch::PongReceived => pong_deadline = None,
                        Dispatch::Forward(msg) => {
                            debug!(kind = msg.kind(), "Signaling receive");
                            if self.events.send(SignalingEvent::Message(msg)).await.is_err() {
                                return SessionEnd::Closed;
                            }
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = send_json(&mut sink, &SignalMessage::Ping).await {
                        return SessionEnd::Dropped(e);
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }

                _ = liveness => {
                    return SessionEnd::Dropped(NetError::Timeout("pong"));
                }
            }
        }
    }

    async fn set_state(&self, state: SignalingState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state);
        let _ = self.events.send(SignalingEvent::StateChanged(state)).await;
    }
}

async fn send_json<S>(sink: &mut S, msg: &SignalMessage) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(msg.to_json()?)).await?;
    Ok(())
}
