//! Error type shared by every part of the live client

use crate::session::SessionState;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for live session operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Socket not connected")]
    NotConnected,

    #[error("Session is not live")]
    NotLive,

    #[error("Timed out waiting for the live session")]
    ConnectTimeout,

    #[error("Illegal session transition {from:?} -> {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Media source ended")]
    SourceEnded,

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Tool execution failed: {0}")]
    Tool(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, LiveError>;
