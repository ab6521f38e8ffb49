//! Frame types for the Tandem protocol.
//!
//! Every message on a Tandem connection is a JSON object tagged by its
//! `type` field. Signaling frames carry an opaque `signalData` payload that
//! the server never looks into.

use crate::identity::{ClientIdentity, PairId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Signal,
    OnlineContacts,
    ContactOnline,
    ContactOffline,
    MatchFound,
    PeerDisconnected,
    Ping,
}

impl FrameType {
    /// The wire name of this frame type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Signal => "signal",
            FrameType::OnlineContacts => "online-contacts",
            FrameType::ContactOnline => "contact-online",
            FrameType::ContactOffline => "contact-offline",
            FrameType::MatchFound => "match-found",
            FrameType::PeerDisconnected => "peer-disconnected",
            FrameType::Ping => "ping",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a signaling message exchanged between two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    /// SDP offer starting a call.
    #[serde(rename = "offer")]
    Offer,
    /// SDP answer accepting a call.
    #[serde(rename = "answer")]
    Answer,
    /// Trickled ICE candidate.
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    /// Explicit end of a direct call.
    #[serde(rename = "hang-up")]
    HangUp,
    /// Chat text delivered in real time.
    #[serde(rename = "instant-message")]
    InstantMessage,
}

impl SignalType {
    /// The wire name of this signal type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice-candidate",
            SignalType::HangUp => "hang-up",
            SignalType::InstantMessage => "instant-message",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signaling message addressed from one identity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Recipient identity.
    pub to: ClientIdentity,
    /// Sender identity.
    pub from: ClientIdentity,
    /// What kind of signal this is.
    pub signal_type: SignalType,
    /// Opaque payload (SDP, ICE candidate, chat text...).
    #[serde(default)]
    pub signal_data: serde_json::Value,
}

/// Role assigned to each side of a random-call pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Creates the offer. Always the earlier arrival.
    #[serde(rename = "caller")]
    Initiator,
    /// Waits for the offer and answers.
    #[serde(rename = "callee")]
    Responder,
}

/// A contact as shown to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    /// Contact identity.
    pub contact_id: ClientIdentity,
    /// Display name, if the directory knows one.
    pub contact_name: Option<String>,
}

impl ContactSummary {
    /// Create a contact summary.
    #[must_use]
    pub fn new(contact_id: ClientIdentity, contact_name: Option<String>) -> Self {
        Self {
            contact_id,
            contact_name,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Signaling envelope relayed between two identities.
    #[serde(rename = "signal")]
    Signal(SignalEnvelope),

    /// Batch of contacts already online, sent once after connecting.
    #[serde(rename = "online-contacts")]
    OnlineContacts {
        /// Contacts currently connected.
        contacts: Vec<ContactSummary>,
    },

    /// A contact came online.
    #[serde(rename = "contact-online")]
    ContactOnline {
        /// The contact that changed state.
        contact: ContactSummary,
    },

    /// A contact went offline.
    #[serde(rename = "contact-offline")]
    ContactOffline {
        /// The contact that changed state.
        contact: ContactSummary,
    },

    /// A random-call partner was found.
    #[serde(rename = "match-found", rename_all = "camelCase")]
    MatchFound {
        /// Identifier of the pairing.
        pair_id: PairId,
        /// Role of the receiving side.
        role: Role,
    },

    /// The random-call partner went away.
    #[serde(rename = "peer-disconnected")]
    PeerDisconnected,

    /// Client heartbeat.
    #[serde(rename = "ping")]
    Ping,
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Signal(_) => FrameType::Signal,
            Frame::OnlineContacts { .. } => FrameType::OnlineContacts,
            Frame::ContactOnline { .. } => FrameType::ContactOnline,
            Frame::ContactOffline { .. } => FrameType::ContactOffline,
            Frame::MatchFound { .. } => FrameType::MatchFound,
            Frame::PeerDisconnected => FrameType::PeerDisconnected,
            Frame::Ping => FrameType::Ping,
        }
    }

    /// Create a new Signal frame.
    #[must_use]
    pub fn signal(
        to: ClientIdentity,
        from: ClientIdentity,
        signal_type: SignalType,
        signal_data: serde_json::Value,
    ) -> Self {
        Frame::Signal(SignalEnvelope {
            to,
            from,
            signal_type,
            signal_data,
        })
    }

    /// Create a new OnlineContacts frame.
    #[must_use]
    pub fn online_contacts(contacts: Vec<ContactSummary>) -> Self {
        Frame::OnlineContacts { contacts }
    }

    /// Create a new ContactOnline frame.
    #[must_use]
    pub fn contact_online(contact: ContactSummary) -> Self {
        Frame::ContactOnline { contact }
    }

    /// Create a new ContactOffline frame.
    #[must_use]
    pub fn contact_offline(contact: ContactSummary) -> Self {
        Frame::ContactOffline { contact }
    }

    /// Create a new MatchFound frame.
    #[must_use]
    pub fn match_found(pair_id: PairId, role: Role) -> Self {
        Frame::MatchFound { pair_id, role }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping
    }
}
