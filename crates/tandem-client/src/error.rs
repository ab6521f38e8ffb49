//! Client errors.

use thiserror::Error;

/// Errors raised by the signaling client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server refused the upgrade, e.g. `401` for a bad token.
    #[error("Server rejected connection with HTTP {0}")]
    Rejected(u16),

    /// The WebSocket handshake or stream failed.
    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tandem_protocol::ProtocolError),

    /// A JSON payload could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
