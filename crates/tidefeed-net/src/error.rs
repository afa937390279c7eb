use thiserror::Error;

use tidefeed_shared::SharedError;

/// Transport-class failures. These are absorbed by the actors that own the
/// connection and surface to callers only as state.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] SharedError),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Connection closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
