//! # tandem-protocol
//!
//! Wire protocol definitions for the Tandem signaling relay.
//!
//! Clients and the server exchange JSON objects over a WebSocket, one object
//! per text message, tagged by `type`.
//!
//! ## Frame Types
//!
//! - `signal` - Offer / answer / ICE / hang-up / instant message between two identities
//! - `online-contacts` / `contact-online` / `contact-offline` - Presence
//! - `match-found` / `peer-disconnected` - Random-call pairing
//! - `ping` - Client heartbeat
//!
//! ## Example
//!
//! ```rust
//! use tandem_protocol::{codec, ClientIdentity, Frame, Inbound, SignalType};
//!
//! let frame = Frame::signal(
//!     ClientIdentity::generate(),
//!     ClientIdentity::generate(),
//!     SignalType::Offer,
//!     serde_json::json!({"sdp": "v=0"}),
//! );
//!
//! let text = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&text).unwrap(), Inbound::Frame(frame));
//! ```

pub mod codec;
pub mod frames;
pub mod identity;

pub use codec::{decode, encode, Inbound, ProtocolError};
pub use frames::{ContactSummary, Frame, FrameType, Role, SignalEnvelope, SignalType};
pub use identity::{ClientIdentity, PairId};
