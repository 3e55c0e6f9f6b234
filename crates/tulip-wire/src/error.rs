//! Errors from the connection and session layer.

use thiserror::Error;
use tulip_types::TulipError;

/// Errors raised by transports, dialing, provisioning and key derivation.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("SOCKS proxy error: {0}")]
    Socks(#[from] tokio_socks::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Talk {0} is closed")]
    TalkClosed(String),
    #[error("Tor control error: {0}")]
    Control(String),
    #[error("Tor control authentication failed: {0}")]
    ControlAuth(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error(transparent)]
    Tulip(#[from] TulipError),
}
