//! Client-side view of presence and calls.
//!
//! [`ClientState::apply`] folds each frame received from the relay into the
//! roster of online contacts and the list of pending incoming calls, and
//! reports what changed.

use serde_json::Value;
use tandem_protocol::{ClientIdentity, ContactSummary, Frame, PairId, Role, SignalEnvelope, SignalType};

/// Contacts currently online, in the order they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    contacts: Vec<ContactSummary>,
}

impl Roster {
    /// Merge a batch, skipping contacts already present.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = ContactSummary>) {
        for contact in batch {
            self.add(contact);
        }
    }

    /// Add one contact. Returns `false` if it was already present.
    pub fn add(&mut self, contact: ContactSummary) -> bool {
        if self.contains(&contact.contact_id) {
            return false;
        }
        self.contacts.push(contact);
        true
    }

    /// Remove a contact. Returns `false` if it was not present.
    pub fn remove(&mut self, contact_id: &ClientIdentity) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|contact| contact.contact_id != *contact_id);
        self.contacts.len() != before
    }

    /// Check if `contact_id` is online.
    #[must_use]
    pub fn contains(&self, contact_id: &ClientIdentity) -> bool {
        self.contacts
            .iter()
            .any(|contact| contact.contact_id == *contact_id)
    }

    /// Online contacts.
    #[must_use]
    pub fn contacts(&self) -> &[ContactSummary] {
        &self.contacts
    }

    /// Number of online contacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Check if no contact is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// An offer that has not been answered yet.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    /// Calling identity.
    pub from: ClientIdentity,
    /// The caller's session description.
    pub offer: Value,
}

/// Unanswered offers, one per caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingCalls {
    calls: Vec<IncomingCall>,
}

impl IncomingCalls {
    /// Record an offer. A repeated offer from the same caller replaces the
    /// earlier one.
    pub fn offer(&mut self, from: ClientIdentity, offer: Value) {
        match self.calls.iter_mut().find(|call| call.from == from) {
            Some(call) => call.offer = offer,
            None => self.calls.push(IncomingCall { from, offer }),
        }
    }

    /// Remove and return the pending offer from `from`, e.g. to answer it.
    pub fn take(&mut self, from: &ClientIdentity) -> Option<IncomingCall> {
        let index = self.calls.iter().position(|call| call.from == *from)?;
        Some(self.calls.remove(index))
    }

    /// Check if `from` is calling.
    #[must_use]
    pub fn is_calling(&self, from: &ClientIdentity) -> bool {
        self.calls.iter().any(|call| call.from == *from)
    }

    /// Pending calls, oldest first.
    #[must_use]
    pub fn pending(&self) -> &[IncomingCall] {
        &self.calls
    }
}

/// What a received frame meant to this client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The roster changed.
    RosterChanged,
    /// A contact is calling.
    IncomingCall { from: ClientIdentity },
    /// The callee answered our offer.
    Answered { from: ClientIdentity, answer: Value },
    /// The peer sent an ICE candidate.
    Candidate { from: ClientIdentity, candidate: Value },
    /// The peer hung up, or withdrew an unanswered offer.
    HungUp { from: ClientIdentity },
    /// Chat message from a contact.
    InstantMessage { from: ClientIdentity, message: Value },
    /// A random-call partner was found.
    Matched { pair_id: PairId, role: Role },
    /// The random-call partner went away.
    PeerDisconnected,
    /// Nothing changed.
    Ignored,
}

/// Roster and incoming calls of one client.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    /// Online contacts.
    pub roster: Roster,
    /// Unanswered offers.
    pub incoming: IncomingCalls,
}

impl ClientState {
    /// Create empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `frame` into the state.
    pub fn apply(&mut self, frame: &Frame) -> ClientEvent {
        match frame {
            Frame::OnlineContacts { contacts } => {
                self.roster.merge(contacts.iter().cloned());
                ClientEvent::RosterChanged
            }
            Frame::ContactOnline { contact } => {
                if self.roster.add(contact.clone()) {
                    ClientEvent::RosterChanged
                } else {
                    ClientEvent::Ignored
                }
            }
            Frame::ContactOffline { contact } => {
                if self.roster.remove(&contact.contact_id) {
                    ClientEvent::RosterChanged
                } else {
                    ClientEvent::Ignored
                }
            }
            Frame::Signal(envelope) => self.apply_signal(envelope),
            Frame::MatchFound { pair_id, role } => ClientEvent::Matched {
                pair_id: *pair_id,
                role: *role,
            },
            Frame::PeerDisconnected => ClientEvent::PeerDisconnected,
            Frame::Ping => ClientEvent::Ignored,
        }
    }

    fn apply_signal(&mut self, envelope: &SignalEnvelope) -> ClientEvent {
        let from = envelope.from;
        let data = envelope.signal_data.clone();

        match envelope.signal_type {
            SignalType::Offer => {
                self.incoming.offer(from, data);
                ClientEvent::IncomingCall { from }
            }
            SignalType::Answer => ClientEvent::Answered { from, answer: data },
            SignalType::IceCandidate => ClientEvent::Candidate {
                from,
                candidate: data,
            },
            SignalType::HangUp => {
                self.incoming.take(&from);
                ClientEvent::HungUp { from }
            }
            SignalType::InstantMessage => ClientEvent::InstantMessage {
                from,
                message: data,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact(id: ClientIdentity) -> ContactSummary {
        ContactSummary::new(id, None)
    }

    #[test]
    fn test_roster_merge_skips_duplicates() {
        let a = ClientIdentity::generate();
        let b = ClientIdentity::generate();
        let mut state = ClientState::new();

        state.apply(&Frame::contact_online(contact(a)));
        state.apply(&Frame::online_contacts(vec![contact(b), contact(a)]));

        let ids: Vec<_> = state.roster.contacts().iter().map(|c| c.contact_id).collect();
        assert_eq!(ids, vec![a, b]);

        assert_eq!(
            state.apply(&Frame::contact_online(contact(b))),
            ClientEvent::Ignored
        );
        assert_eq!(
            state.apply(&Frame::contact_offline(contact(a))),
            ClientEvent::RosterChanged
        );
        assert!(!state.roster.contains(&a));
        assert_eq!(state.roster.len(), 1);
    }

    #[test]
    fn test_offer_then_hang_up_clears_incoming_call() {
        let me = ClientIdentity::generate();
        let caller = ClientIdentity::generate();
        let mut state = ClientState::new();

        let offer = Frame::signal(me, caller, SignalType::Offer, json!({"sdp": "v=0"}));
        assert_eq!(state.apply(&offer), ClientEvent::IncomingCall { from: caller });
        assert!(state.incoming.is_calling(&caller));

        let hang_up = Frame::signal(me, caller, SignalType::HangUp, Value::Null);
        assert_eq!(state.apply(&hang_up), ClientEvent::HungUp { from: caller });
        assert!(state.incoming.pending().is_empty());
    }

    #[test]
    fn test_hang_up_from_other_peer_keeps_call() {
        let me = ClientIdentity::generate();
        let caller = ClientIdentity::generate();
        let other = ClientIdentity::generate();
        let mut state = ClientState::new();

        state.apply(&Frame::signal(me, caller, SignalType::Offer, json!({"sdp": "a"})));
        state.apply(&Frame::signal(me, caller, SignalType::Offer, json!({"sdp": "b"})));
        state.apply(&Frame::signal(me, other, SignalType::HangUp, Value::Null));

        let call = state.incoming.take(&caller).unwrap();
        assert_eq!(call.offer, json!({"sdp": "b"}));
        assert!(state.incoming.take(&caller).is_none());
    }

    #[test]
    fn test_random_call_events() {
        let mut state = ClientState::new();
        let pair_id = PairId::generate();

        assert_eq!(
            state.apply(&Frame::match_found(pair_id, Role::Initiator)),
            ClientEvent::Matched {
                pair_id,
                role: Role::Initiator
            }
        );
        assert_eq!(
            state.apply(&Frame::PeerDisconnected),
            ClientEvent::PeerDisconnected
        );
        assert_eq!(state.apply(&Frame::ping()), ClientEvent::Ignored);
    }
}
