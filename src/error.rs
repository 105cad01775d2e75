// src/error.rs

use std::sync::Arc;
use thiserror::Error;

/// The single error type threaded through the hub, the hub client, and
/// both role processes.
#[derive(Debug, Error, Clone)]
pub enum FleetError {
    #[error("invalid IPC token")]
    InvalidIpcToken,

    #[error("command '{0}' is already registered")]
    CommandAlreadyExists(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("callback {0} timed out")]
    CallbackTimeout(u64),

    #[error("uid {0} is not connected")]
    UnknownUid(u32),

    #[error("websocket error: {0}")]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),

    #[error("json error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for FleetError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Arc::new(e))
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

impl From<std::io::Error> for FleetError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
