//! # tandem-client
//!
//! Client side of the Tandem signaling relay.
//!
//! - **SignalingClient** - WebSocket connection with a background heartbeat
//! - **CandidateQueue** - Holds ICE candidates that arrive before the remote description
//! - **ClientState** - Online-contact roster and unanswered incoming calls
//!
//! ```rust,ignore
//! use tandem_client::{ClientConfig, ClientState, SignalingClient};
//!
//! let mut client = SignalingClient::connect("ws://127.0.0.1:8080/ws/direct", &token, ClientConfig::default()).await?;
//! let mut state = ClientState::new();
//! while let Some(received) = client.next().await {
//!     if let Some(frame) = received.frame() {
//!         let event = state.apply(frame);
//!         // React to the event
//!     }
//! }
//! ```

pub mod candidates;
pub mod error;
pub mod state;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use candidates::CandidateQueue;
pub use error::ClientError;
pub use state::{ClientEvent, ClientState, IncomingCall, IncomingCalls, Roster};

#[cfg(feature = "websocket")]
pub use websocket::{ClientConfig, Received, SignalingClient, DEFAULT_HEARTBEAT_INTERVAL};
