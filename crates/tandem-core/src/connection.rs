//! Live connection handles.
//!
//! A [`ConnectionHandle`] is the write side of one client connection. The
//! connection task owns the matching receiver and drains it into the socket,
//! so everything pushed through one handle reaches the client in order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_protocol::{codec, ClientIdentity, Frame, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Atomic counter for connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

/// Why the server asked a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatTimeout,
}

impl CloseReason {
    /// Short description, suitable for a WebSocket close frame.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
        }
    }
}

/// An item queued for delivery to a connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-encoded text frame, shared between recipients.
    Text(Arc<str>),
    /// Close the connection.
    Close(CloseReason),
}

/// Errors when pushing to a connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection task is gone.
    #[error("Connection closed")]
    Closed,

    /// The frame could not be encoded.
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Write side of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: ClientIdentity,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its connection task drains.
    #[must_use]
    pub fn channel(identity: ClientIdentity) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::next(),
            identity,
            outbound,
        };
        (handle, rx)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the identity this connection authenticated as.
    #[must_use]
    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    /// Queue pre-encoded text for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the connection task has ended.
    pub fn send_text(&self, text: Arc<str>) -> Result<(), SendError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| SendError::Closed)
    }

    /// Encode and queue a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection task has ended.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let text = codec::encode_shared(frame)?;
        self.send_text(text)
    }

    /// Ask the connection task to close the socket.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the connection task has ended.
    pub fn close(&self, reason: CloseReason) -> Result<(), SendError> {
        self.outbound
            .send(Outbound::Close(reason))
            .map_err(|_| SendError::Closed)
    }

    /// Check if the connection task is still receiving.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}
