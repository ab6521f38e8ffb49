//! Presence tracking for Tandem.
//!
//! Presence follows direct-call connections: an identity is online while it
//! holds a registration. Transitions are fanned out to the identity's
//! accepted contacts that are themselves online.
//!
//! Transitions for one identity are serialized, and an offline transition
//! that finds the identity registered again is abandoned. Contacts therefore
//! never end on `contact-offline` for an identity that holds a connection.

use crate::collaborators::{CollaboratorError, ContactDirectory};
use crate::registry::ConnectionRegistry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{codec, ClientIdentity, ContactSummary, Frame};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Presence state of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    /// Not connected.
    #[default]
    Offline,
    /// Holding a direct-call connection.
    Online,
}

/// Result of bringing an identity online.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlineReport {
    /// Contacts of the identity that are currently online.
    pub already_online: Vec<ContactSummary>,
    /// Number of contacts sent a `contact-online` event.
    pub notified: usize,
}

/// Tracks online/offline state and fans transitions out to contacts.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn ContactDirectory>,
    states: DashMap<ClientIdentity, PresenceState>,
    transitions: DashMap<ClientIdentity, Arc<Mutex<()>>>,
    lookup_timeout: Duration,
}

impl PresenceTracker {
    /// Create a tracker reading contacts from `directory`.
    ///
    /// Directory lookups taking longer than `lookup_timeout` are abandoned.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn ContactDirectory>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            states: DashMap::new(),
            transitions: DashMap::new(),
            lookup_timeout,
        }
    }

    /// Get the presence state of `identity`.
    #[must_use]
    pub fn state(&self, identity: &ClientIdentity) -> PresenceState {
        self.states
            .get(identity)
            .map(|state| *state.value())
            .unwrap_or_default()
    }

    /// Number of identities currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.states.len()
    }

    /// Mark `identity` online and tell its online contacts.
    ///
    /// Returns the contacts already online so the caller can send them to
    /// `identity` as one batch. A failing directory yields an empty report.
    pub async fn mark_online(&self, identity: ClientIdentity) -> OnlineReport {
        let lock = self.transition_lock(identity);
        let report = {
            let _serialized = lock.lock().await;
            self.announce_online(identity).await
        };
        drop(lock);
        self.release_transition_lock(&identity);
        report
    }

    async fn announce_online(&self, identity: ClientIdentity) -> OnlineReport {
        self.states.insert(identity, PresenceState::Online);

        let Some((contacts, name)) = self.lookup(&identity).await else {
            return OnlineReport::default();
        };

        let me = ContactSummary::new(identity, name);
        let notified = self.fan_out(&identity, &contacts, &Frame::contact_online(me));

        let already_online: Vec<ContactSummary> = contacts
            .into_iter()
            .filter(|contact| self.registry.is_online(&contact.contact_id))
            .collect();

        debug!(
            identity = %identity,
            notified,
            online_contacts = already_online.len(),
            "Presence: online"
        );

        OnlineReport {
            already_online,
            notified,
        }
    }

    /// Mark `identity` offline and tell its online contacts.
    ///
    /// Does nothing if `identity` registered a new connection while its
    /// contacts were being looked up; the new connection's own online
    /// transition follows. Returns the number of contacts notified.
    pub async fn mark_offline(&self, identity: ClientIdentity) -> usize {
        let lock = self.transition_lock(identity);
        let notified = {
            let _serialized = lock.lock().await;
            self.announce_offline(identity).await
        };
        drop(lock);
        self.release_transition_lock(&identity);
        notified
    }

    async fn announce_offline(&self, identity: ClientIdentity) -> usize {
        let found = self.lookup(&identity).await;

        if self.registry.is_online(&identity) {
            debug!(identity = %identity, "Reconnected before going offline, presence unchanged");
            return 0;
        }
        self.states.remove(&identity);

        let Some((contacts, name)) = found else {
            return 0;
        };

        let me = ContactSummary::new(identity, name);
        let notified = self.fan_out(&identity, &contacts, &Frame::contact_offline(me));

        debug!(identity = %identity, notified, "Presence: offline");
        notified
    }

    fn transition_lock(&self, identity: ClientIdentity) -> Arc<Mutex<()>> {
        Arc::clone(&*self.transitions.entry(identity).or_default())
    }

    fn release_transition_lock(&self, identity: &ClientIdentity) {
        self.transitions
            .remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Fetch contacts and display name, bounded by the lookup timeout.
    async fn lookup(
        &self,
        identity: &ClientIdentity,
    ) -> Option<(Vec<ContactSummary>, Option<String>)> {
        let directory = Arc::clone(&self.directory);
        let query = async {
            let contacts = directory.accepted_contacts_of(identity).await?;
            let name = match directory.display_name(identity).await {
                Ok(name) => name,
                Err(e) => {
                    debug!(identity = %identity, error = %e, "Display name unavailable");
                    None
                }
            };
            Ok::<_, CollaboratorError>((contacts, name))
        };

        match tokio::time::timeout(self.lookup_timeout, query).await {
            Ok(Ok(found)) => Some(found),
            Ok(Err(e)) => {
                warn!(identity = %identity, error = %e, "Contact lookup failed, skipping presence fan-out");
                None
            }
            Err(_) => {
                warn!(
                    identity = %identity,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Contact lookup timed out, skipping presence fan-out"
                );
                None
            }
        }
    }

    /// Send `frame` to every online contact. Returns the number reached.
    fn fan_out(&self, identity: &ClientIdentity, contacts: &[ContactSummary], frame: &Frame) -> usize {
        let text = match codec::encode_shared(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to encode presence event");
                return 0;
            }
        };

        let mut notified = 0;
        for contact in contacts {
            if contact.contact_id == *identity {
                continue;
            }
            let Some(handle) = self.registry.lookup(&contact.contact_id) else {
                continue;
            };
            match handle.send_text(Arc::clone(&text)) {
                Ok(()) => notified += 1,
                Err(e) => {
                    trace!(contact = %contact.contact_id, error = %e, "Presence event not delivered");
                }
            }
        }
        notified
    }
}
