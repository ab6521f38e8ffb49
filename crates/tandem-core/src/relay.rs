//! Signal relay between registered identities.
//!
//! The relay is a dumb pipe: it looks up the recipient and forwards the
//! sender's frame byte for byte. Drops are silent toward the sender.

use crate::registry::ConnectionRegistry;
use std::fmt;
use std::sync::Arc;
use tandem_protocol::{ClientIdentity, SignalEnvelope};
use tracing::{debug, trace};

/// Why a frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The recipient has no live registration.
    RecipientOffline,
    /// The recipient's connection task has ended.
    RecipientClosed,
    /// The envelope's `from` is not the authenticated sender.
    SenderMismatch,
    /// The sender has no random-call partner.
    NotPaired,
}

impl DropReason {
    /// Short label, used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::RecipientOffline => "recipient_offline",
            DropReason::RecipientClosed => "recipient_closed",
            DropReason::SenderMismatch => "sender_mismatch",
            DropReason::NotPaired => "not_paired",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of forwarding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's connection.
    Delivered,
    /// Not delivered.
    Dropped(DropReason),
}

impl Delivery {
    /// Check if the frame was delivered.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Forwards signaling envelopes to their recipients.
pub struct SignalRelay {
    registry: Arc<ConnectionRegistry>,
}

impl SignalRelay {
    /// Create a relay over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward `raw`, the frame `envelope` was decoded from, to `envelope.to`.
    pub fn forward(
        &self,
        sender: &ClientIdentity,
        envelope: &SignalEnvelope,
        raw: Arc<str>,
    ) -> Delivery {
        if envelope.from != *sender {
            debug!(
                sender = %sender,
                claimed = %envelope.from,
                signal_type = %envelope.signal_type,
                "Dropping envelope with forged sender"
            );
            return Delivery::Dropped(DropReason::SenderMismatch);
        }

        let Some(recipient) = self.registry.lookup(&envelope.to) else {
            debug!(
                from = %envelope.from,
                to = %envelope.to,
                signal_type = %envelope.signal_type,
                "Recipient offline, dropping signal"
            );
            return Delivery::Dropped(DropReason::RecipientOffline);
        };

        match recipient.send_text(raw) {
            Ok(()) => {
                trace!(
                    from = %envelope.from,
                    to = %envelope.to,
                    connection = %recipient.id(),
                    signal_type = %envelope.signal_type,
                    "Relayed signal"
                );
                Delivery::Delivered
            }
            Err(_) => {
                debug!(
                    to = %envelope.to,
                    connection = %recipient.id(),
                    "Recipient connection closed, dropping signal"
                );
                Delivery::Dropped(DropReason::RecipientClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, Outbound};
    use serde_json::json;
    use tandem_protocol::{codec, Frame, Inbound, SignalType};

    fn envelope_text(from: ClientIdentity, to: ClientIdentity, kind: SignalType, n: u32) -> String {
        codec::encode(&Frame::signal(to, from, kind, json!({"seq": n}))).unwrap()
    }

    fn envelope_of(text: &str) -> SignalEnvelope {
        match codec::decode(text).unwrap() {
            Inbound::Frame(Frame::Signal(envelope)) => envelope,
            other => panic!("Expected signal, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_is_verbatim() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = SignalRelay::new(Arc::clone(&registry));
        let alice = ClientIdentity::generate();
        let bob = ClientIdentity::generate();
        let (bob_handle, mut bob_rx) = ConnectionHandle::channel(bob);
        registry.register(bob, bob_handle);

        // Key order and spacing chosen by the client survive the relay.
        let raw = format!(
            r#"{{ "signalData": {{"sdp":"v=0"}}, "type": "signal", "signalType": "offer", "from": "{alice}", "to": "{bob}" }}"#
        );
        let envelope = envelope_of(&raw);

        let delivery = relay.forward(&alice, &envelope, Arc::from(raw.as_str()));
        assert_eq!(delivery, Delivery::Delivered);
        assert!(matches!(bob_rx.try_recv(), Ok(Outbound::Text(t)) if *t == *raw));
    }

    #[test]
    fn test_forward_preserves_order_for_all_signal_types() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = SignalRelay::new(Arc::clone(&registry));
        let alice = ClientIdentity::generate();
        let bob = ClientIdentity::generate();
        let (bob_handle, mut bob_rx) = ConnectionHandle::channel(bob);
        registry.register(bob, bob_handle);

        let kinds = [
            SignalType::Offer,
            SignalType::IceCandidate,
            SignalType::IceCandidate,
            SignalType::InstantMessage,
            SignalType::HangUp,
        ];
        let sent: Vec<String> = kinds
            .iter()
            .enumerate()
            .map(|(n, kind)| envelope_text(alice, bob, *kind, n as u32))
            .collect();

        for text in &sent {
            let delivery = relay.forward(&alice, &envelope_of(text), Arc::from(text.as_str()));
            assert!(delivery.is_delivered());
        }

        for text in &sent {
            assert!(matches!(bob_rx.try_recv(), Ok(Outbound::Text(t)) if *t == **text));
        }
    }

    #[test]
    fn test_forward_to_offline_recipient_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = SignalRelay::new(registry);
        let alice = ClientIdentity::generate();
        let text = envelope_text(alice, ClientIdentity::generate(), SignalType::Offer, 0);

        assert_eq!(
            relay.forward(&alice, &envelope_of(&text), Arc::from(text.as_str())),
            Delivery::Dropped(DropReason::RecipientOffline)
        );
    }

    #[test]
    fn test_forward_to_closed_recipient_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = SignalRelay::new(Arc::clone(&registry));
        let alice = ClientIdentity::generate();
        let bob = ClientIdentity::generate();
        let (bob_handle, bob_rx) = ConnectionHandle::channel(bob);
        registry.register(bob, bob_handle);
        drop(bob_rx);

        let text = envelope_text(alice, bob, SignalType::Answer, 0);
        assert_eq!(
            relay.forward(&alice, &envelope_of(&text), Arc::from(text.as_str())),
            Delivery::Dropped(DropReason::RecipientClosed)
        );
    }

    #[test]
    fn test_forged_sender_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = SignalRelay::new(Arc::clone(&registry));
        let mallory = ClientIdentity::generate();
        let alice = ClientIdentity::generate();
        let bob = ClientIdentity::generate();
        let (bob_handle, mut bob_rx) = ConnectionHandle::channel(bob);
        registry.register(bob, bob_handle);

        let text = envelope_text(alice, bob, SignalType::Offer, 0);
        assert_eq!(
            relay.forward(&mallory, &envelope_of(&text), Arc::from(text.as_str())),
            Delivery::Dropped(DropReason::SenderMismatch)
        );
        assert!(bob_rx.try_recv().is_err());
    }
}
