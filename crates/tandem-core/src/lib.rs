//! # tandem-core
//!
//! Connection bookkeeping and routing for the Tandem signaling relay.
//!
//! This crate provides the building blocks:
//!
//! - **Registry** - Identity to live connection map
//! - **Presence** - Online/offline state fanned out to contacts
//! - **Relay** - Verbatim forwarding of signaling envelopes
//! - **Matcher** - FIFO random pairing of anonymous participants
//! - **Keep-alive** - Liveness tracking and optional reaping
//! - **Collaborators** - Token, contact and call-log services
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!  /ws/direct ────▶│  Switchboard │◀──── /ws/random
//!                  └──────────────┘
//!            ┌──────────┬───┴────┬─────────────┐
//!            ▼          ▼        ▼             ▼
//!     ┌──────────┐ ┌─────────┐ ┌─────────┐ ┌───────────┐
//!     │ Presence │ │  Relay  │ │ Matcher │ │ KeepAlive │
//!     └──────────┘ └─────────┘ └─────────┘ └───────────┘
//!            │          │
//!            ▼          ▼
//!         ┌────────────────┐
//!         │    Registry    │
//!         └────────────────┘
//! ```

pub mod collaborators;
pub mod connection;
pub mod keepalive;
pub mod matcher;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod switchboard;

pub use collaborators::{
    AuthError, CallKind, CallLog, CallLogId, CallRecord, CollaboratorError, ContactDirectory,
    MemoryCallLog, MemoryDirectory, NullCallLog, PrincipalLookup, RelationshipStatus, StaticTokens,
    TokenValidator, UserRecord,
};
pub use connection::{CloseReason, ConnectionHandle, ConnectionId, Outbound, SendError};
pub use keepalive::KeepAliveSupervisor;
pub use matcher::{JoinOutcome, LeaveOutcome, MatcherStats, PairInfo, RandomPairingMatcher};
pub use presence::{OnlineReport, PresenceState, PresenceTracker};
pub use registry::ConnectionRegistry;
pub use relay::{Delivery, DropReason, SignalRelay};
pub use switchboard::{Dispatch, Switchboard, SwitchboardConfig, SwitchboardStats};
