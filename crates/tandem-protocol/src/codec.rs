//! Codec for encoding and decoding Tandem frames.
//!
//! Frames travel as WebSocket text messages holding one JSON object each.
//! Decoding sorts an inbound message into one of three buckets: a heartbeat,
//! a known [`Frame`], or well-formed JSON the server does not interpret.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Type tag of the heartbeat control message.
pub const HEARTBEAT_TYPE: &str = "ping";

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Inbound text is not JSON.
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Keep-alive control message. Carries no routing information.
    Heartbeat,
    /// A frame this protocol defines.
    Frame(Frame),
    /// Well-formed JSON that is not a known frame.
    Opaque(Value),
}

/// Encode a frame to JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(ProtocolError::Encode)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Encode a frame once for delivery to many connections.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_shared(frame: &Frame) -> Result<Arc<str>, ProtocolError> {
    encode(frame).map(Arc::from)
}

/// Decode an inbound text message.
///
/// # Errors
///
/// Returns an error if the text is too large or is not JSON.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

    if is_heartbeat(&value) {
        return Ok(Inbound::Heartbeat);
    }

    match Frame::deserialize(&value) {
        Ok(frame) => Ok(Inbound::Frame(frame)),
        Err(_) => Ok(Inbound::Opaque(value)),
    }
}

fn is_heartbeat(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(HEARTBEAT_TYPE)
}
