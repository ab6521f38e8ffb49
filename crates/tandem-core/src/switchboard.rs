//! The switchboard ties the relay components together.
//!
//! One [`Switchboard`] is built at startup with the injected collaborators
//! and shared by every connection task. Direct-call connections go through
//! the registry, presence and relay; random-call connections go through the
//! matcher. Both kinds are watched by the keep-alive supervisor.

use crate::collaborators::{CallLog, ContactDirectory};
use crate::connection::{ConnectionHandle, Outbound};
use crate::keepalive::KeepAliveSupervisor;
use crate::matcher::{JoinOutcome, LeaveOutcome, MatcherStats, RandomPairingMatcher};
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::relay::{Delivery, SignalRelay};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{codec, ClientIdentity, Frame, Inbound};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

/// Switchboard configuration.
#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    /// Upper bound on a contact-directory lookup.
    pub directory_timeout: Duration,
    /// Close connections silent for longer than this. `None` disables reaping.
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            directory_timeout: Duration::from_secs(5),
            heartbeat_timeout: None,
        }
    }
}

/// What happened to one inbound text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A heartbeat; liveness recorded.
    Heartbeat,
    /// Forwarded, or dropped by the relay or matcher.
    Forwarded(Delivery),
    /// Well-formed but not something this endpoint relays.
    Ignored,
    /// Not valid JSON or over the size limit.
    Malformed,
}

/// Snapshot of switchboard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwitchboardStats {
    /// Identities with a direct-call connection.
    pub online: usize,
    /// Random-call participants waiting.
    pub waiting: usize,
    /// Active random-call pairings.
    pub sessions: usize,
    /// Random-call pairings formed since start.
    pub pairs_formed: u64,
    /// Connections watched for liveness.
    pub tracked: usize,
}

/// Composition root of the relay.
pub struct Switchboard {
    registry: Arc<ConnectionRegistry>,
    presence: PresenceTracker,
    relay: SignalRelay,
    matcher: RandomPairingMatcher,
    keepalive: Arc<KeepAliveSupervisor>,
}

impl Switchboard {
    /// Create a switchboard over the given collaborators.
    #[must_use]
    pub fn new(
        config: SwitchboardConfig,
        directory: Arc<dyn ContactDirectory>,
        call_log: Arc<dyn CallLog>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            presence: PresenceTracker::new(
                Arc::clone(&registry),
                directory,
                config.directory_timeout,
            ),
            relay: SignalRelay::new(Arc::clone(&registry)),
            matcher: RandomPairingMatcher::new(call_log),
            keepalive: Arc::new(KeepAliveSupervisor::new(config.heartbeat_timeout)),
            registry,
        }
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get the presence tracker.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Get the random-call matcher.
    #[must_use]
    pub fn matcher(&self) -> &RandomPairingMatcher {
        &self.matcher
    }

    /// Get the keep-alive supervisor.
    #[must_use]
    pub fn keepalive(&self) -> &Arc<KeepAliveSupervisor> {
        &self.keepalive
    }

    /// Admit a direct-call connection for `identity`.
    ///
    /// Registers the connection, announces it to online contacts and queues
    /// the `online-contacts` batch as the first frame on the new connection.
    pub async fn open_direct(
        &self,
        identity: ClientIdentity,
    ) -> (ConnectionHandle, UnboundedReceiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::channel(identity);
        self.registry.register(identity, handle.clone());
        self.keepalive.track(&handle);

        let report = self.presence.mark_online(identity).await;
        if let Err(e) = handle.send_frame(&Frame::online_contacts(report.already_online)) {
            debug!(connection = %handle.id(), error = %e, "online-contacts not delivered");
        }

        (handle, rx)
    }

    /// Handle one text frame from a direct-call connection.
    pub fn handle_direct(&self, handle: &ConnectionHandle, text: &str) -> Dispatch {
        self.keepalive.touch(handle.id());

        match codec::decode(text) {
            Ok(Inbound::Heartbeat) => Dispatch::Heartbeat,
            Ok(Inbound::Frame(Frame::Signal(envelope))) => {
                Dispatch::Forwarded(self.relay.forward(&handle.identity(), &envelope, Arc::from(text)))
            }
            Ok(other) => {
                debug!(connection = %handle.id(), frame = ?other, "Ignoring non-signal frame");
                Dispatch::Ignored
            }
            Err(e) => {
                warn!(connection = %handle.id(), error = %e, "Discarding malformed frame");
                Dispatch::Malformed
            }
        }
    }

    /// Tear down a direct-call connection.
    ///
    /// Returns `true` if this connection was still the identity's current
    /// registration, in which case contacts are told it went offline.
    pub async fn close_direct(&self, handle: &ConnectionHandle) -> bool {
        self.keepalive.forget(handle.id());

        let identity = handle.identity();
        if !self.registry.remove(&identity, handle) {
            return false;
        }
        self.presence.mark_offline(identity).await;
        true
    }

    /// Admit a random-call connection for `identity` and try to pair it.
    pub fn open_random(
        &self,
        identity: ClientIdentity,
    ) -> (ConnectionHandle, UnboundedReceiver<Outbound>, JoinOutcome) {
        let (handle, rx) = ConnectionHandle::channel(identity);
        self.keepalive.track(&handle);
        let outcome = self.matcher.join(handle.clone());
        (handle, rx, outcome)
    }

    /// Handle one text frame from a random-call connection.
    ///
    /// Anything other than a heartbeat is forwarded verbatim to the partner.
    pub fn handle_random(&self, handle: &ConnectionHandle, text: &str) -> Dispatch {
        self.keepalive.touch(handle.id());

        match codec::decode(text) {
            Ok(Inbound::Heartbeat) => Dispatch::Heartbeat,
            Ok(_) => Dispatch::Forwarded(self.matcher.forward_in_pair(handle.id(), Arc::from(text))),
            Err(e) => {
                warn!(connection = %handle.id(), error = %e, "Discarding malformed frame");
                Dispatch::Malformed
            }
        }
    }

    /// Tear down a random-call connection.
    pub fn close_random(&self, handle: &ConnectionHandle) -> LeaveOutcome {
        self.keepalive.forget(handle.id());
        self.matcher.leave(handle.id())
    }

    /// Get a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> SwitchboardStats {
        let MatcherStats {
            waiting,
            sessions,
            pairs_formed,
        } = self.matcher.stats();

        SwitchboardStats {
            online: self.registry.len(),
            waiting,
            sessions,
            pairs_formed,
            tracked: self.keepalive.tracked_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        CollaboratorError, MemoryCallLog, MemoryDirectory, NullCallLog, RelationshipStatus,
    };
    use crate::presence::PresenceState;
    use crate::relay::DropReason;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tandem_protocol::{ContactSummary, SignalType};

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    fn switchboard(directory: Arc<MemoryDirectory>) -> Switchboard {
        Switchboard::new(SwitchboardConfig::default(), directory, Arc::new(NullCallLog))
    }

    fn signal(from: ClientIdentity, to: ClientIdentity, kind: SignalType) -> String {
        codec::encode(&Frame::signal(to, from, kind, json!({"sdp": "v=0"}))).unwrap()
    }

    #[tokio::test]
    async fn test_reconnect_race_keeps_new_registration() {
        let directory = Arc::new(MemoryDirectory::new());
        let board = switchboard(directory.clone());
        let u = ClientIdentity::generate();
        let a = ClientIdentity::generate();
        directory.add_relationship(u, a, RelationshipStatus::Accepted);

        let (a_handle, mut a_rx) = board.open_direct(a).await;
        let (old, _old_rx) = board.open_direct(u).await;
        let (new, mut new_rx) = board.open_direct(u).await;
        drain(&mut a_rx);
        drain(&mut new_rx);

        // The superseded socket closes after the reconnect.
        assert!(!board.close_direct(&old).await);
        assert_eq!(board.registry().lookup(&u), Some(new.clone()));
        assert!(drain(&mut a_rx).is_empty());

        // Signals for u reach the new connection.
        let text = signal(a, u, SignalType::Offer);
        assert_eq!(
            board.handle_direct(&a_handle, &text),
            Dispatch::Forwarded(Delivery::Delivered)
        );
        assert_eq!(drain(&mut new_rx)[0]["signalType"], "offer");

        assert!(board.close_direct(&new).await);
        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "contact-offline");
    }

    /// Directory whose next contact lookup stalls once armed.
    struct SlowDirectory {
        inner: MemoryDirectory,
        stall_next: AtomicBool,
    }

    #[async_trait]
    impl ContactDirectory for SlowDirectory {
        async fn accepted_contacts_of(
            &self,
            identity: &ClientIdentity,
        ) -> Result<Vec<ContactSummary>, CollaboratorError> {
            if self.stall_next.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.inner.accepted_contacts_of(identity).await
        }

        async fn display_name(
            &self,
            identity: &ClientIdentity,
        ) -> Result<Option<String>, CollaboratorError> {
            self.inner.display_name(identity).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_slow_offline_lookup() {
        let directory = Arc::new(SlowDirectory {
            inner: MemoryDirectory::new(),
            stall_next: AtomicBool::new(false),
        });
        let board = Arc::new(Switchboard::new(
            SwitchboardConfig::default(),
            directory.clone(),
            Arc::new(NullCallLog),
        ));
        let u = ClientIdentity::generate();
        let a = ClientIdentity::generate();
        directory
            .inner
            .add_relationship(u, a, RelationshipStatus::Accepted);

        let (_a_handle, mut a_rx) = board.open_direct(a).await;
        let (old, _old_rx) = board.open_direct(u).await;
        drain(&mut a_rx);

        // The offline lookup stalls and u reconnects meanwhile.
        directory.stall_next.store(true, Ordering::SeqCst);
        let closing = {
            let board = Arc::clone(&board);
            tokio::spawn(async move { board.close_direct(&old).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (new, _new_rx) = board.open_direct(u).await;
        assert!(closing.await.unwrap());

        let kinds: Vec<String> = drain(&mut a_rx)
            .iter()
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(kinds, vec!["contact-online".to_string()]);
        assert!(board.registry().is_online(&u));
        assert_eq!(board.presence().state(&u), PresenceState::Online);

        // A later disconnect still goes through.
        assert!(board.close_direct(&new).await);
        assert_eq!(drain(&mut a_rx)[0]["type"], "contact-offline");
        assert_eq!(board.presence().state(&u), PresenceState::Offline);
    }

    #[tokio::test]
    async fn test_presence_reaches_online_contacts_only() {
        let directory = Arc::new(MemoryDirectory::new());
        let board = switchboard(directory.clone());
        let u = ClientIdentity::generate();
        let a = ClientIdentity::generate();
        let b = ClientIdentity::generate();
        directory.add_user(u, "Ursula", None);
        directory.add_user(a, "Ada", None);
        directory.add_relationship(u, a, RelationshipStatus::Accepted);
        directory.add_relationship(u, b, RelationshipStatus::Accepted);

        let (_a, mut a_rx) = board.open_direct(a).await;
        let first = drain(&mut a_rx);
        assert_eq!(first, vec![json!({"type": "online-contacts", "contacts": []})]);

        let (_u, mut u_rx) = board.open_direct(u).await;

        let to_a = drain(&mut a_rx);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["type"], "contact-online");
        assert_eq!(to_a[0]["contact"]["contactName"], "Ursula");

        let to_u = drain(&mut u_rx);
        assert_eq!(to_u.len(), 1);
        assert_eq!(to_u[0]["type"], "online-contacts");
        assert_eq!(
            to_u[0]["contacts"],
            json!([{"contactId": a.to_string(), "contactName": "Ada"}])
        );

        assert_eq!(board.stats().online, 2);
    }

    #[tokio::test]
    async fn test_direct_heartbeat_and_malformed_frames() {
        let board = switchboard(Arc::new(MemoryDirectory::new()));
        let (handle, mut rx) = board.open_direct(ClientIdentity::generate()).await;
        drain(&mut rx);

        assert_eq!(board.handle_direct(&handle, r#"{"type":"ping"}"#), Dispatch::Heartbeat);
        assert_eq!(board.handle_direct(&handle, "not json"), Dispatch::Malformed);
        assert_eq!(
            board.handle_direct(&handle, r#"{"type":"match-found","pairId":"x"}"#),
            Dispatch::Ignored
        );
        assert!(drain(&mut rx).is_empty());
        assert!(board.registry().is_online(&handle.identity()));
    }

    #[tokio::test]
    async fn test_direct_signal_to_offline_identity_is_dropped() {
        let board = switchboard(Arc::new(MemoryDirectory::new()));
        let me = ClientIdentity::generate();
        let (handle, _rx) = board.open_direct(me).await;

        let text = signal(me, ClientIdentity::generate(), SignalType::HangUp);
        assert_eq!(
            board.handle_direct(&handle, &text),
            Dispatch::Forwarded(Delivery::Dropped(DropReason::RecipientOffline))
        );
    }

    #[tokio::test]
    async fn test_random_call_flow() {
        let call_log = Arc::new(MemoryCallLog::new());
        let board = Switchboard::new(
            SwitchboardConfig::default(),
            Arc::new(MemoryDirectory::new()),
            call_log.clone(),
        );

        let (c1, mut rx1, first) = board.open_random(ClientIdentity::generate());
        assert_eq!(first, JoinOutcome::Waiting { position: 1 });
        let (c2, mut rx2, second) = board.open_random(ClientIdentity::generate());
        assert!(matches!(second, JoinOutcome::Paired(_)));

        assert_eq!(drain(&mut rx1)[0]["role"], "caller");
        assert_eq!(drain(&mut rx2)[0]["role"], "callee");

        // Heartbeats stay local, everything else crosses verbatim.
        assert_eq!(board.handle_random(&c1, r#"{"type":"ping"}"#), Dispatch::Heartbeat);
        let offer = r#"{"type":"offer","offer":{"sdp":"v=0"}}"#;
        assert_eq!(
            board.handle_random(&c1, offer),
            Dispatch::Forwarded(Delivery::Delivered)
        );
        let received = rx2.try_recv();
        assert!(matches!(received, Ok(Outbound::Text(t)) if &*t == offer));

        let stats = board.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.tracked, 2);

        assert!(matches!(board.close_random(&c2), LeaveOutcome::Unpaired { .. }));
        assert_eq!(drain(&mut rx1), vec![json!({"type": "peer-disconnected"})]);
        assert_eq!(board.close_random(&c1), LeaveOutcome::NotPresent);
        assert_eq!(
            board.stats(),
            SwitchboardStats {
                pairs_formed: 1,
                ..SwitchboardStats::default()
            }
        );
    }
}
