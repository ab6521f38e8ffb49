//! Random one-to-one pairing.
//!
//! Participants join a FIFO wait queue. Whenever two are waiting, the two
//! oldest are paired: the first becomes the initiator (`caller`), the second
//! the responder (`callee`). Queue, sessions and membership live behind one
//! mutex so every transition is atomic, and the notifications for a
//! transition are queued before the lock is released.

use crate::collaborators::{CallKind, CallLog, CallLogId};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::relay::{Delivery, DropReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tandem_protocol::{ClientIdentity, Frame, PairId, Role};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Details of a pairing, from the point of view of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairInfo {
    /// The pairing.
    pub pair_id: PairId,
    /// This participant's role.
    pub role: Role,
    /// The other participant.
    pub partner: ClientIdentity,
}

/// Result of [`RandomPairingMatcher::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Queued; `position` is 1-based.
    Waiting { position: usize },
    /// Paired immediately.
    Paired(PairInfo),
    /// The connection is already waiting or paired.
    AlreadyJoined,
}

/// Result of [`RandomPairingMatcher::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The connection was neither waiting nor paired.
    NotPresent,
    /// The connection was removed from the wait queue.
    LeftQueue,
    /// The connection's pairing was torn down.
    Unpaired {
        /// The pairing that ended.
        pair_id: PairId,
        /// Whether `peer-disconnected` was queued for the partner.
        partner_notified: bool,
    },
}

/// Snapshot of matcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatcherStats {
    /// Participants in the wait queue.
    pub waiting: usize,
    /// Active pairings.
    pub sessions: usize,
    /// Pairings formed since start.
    pub pairs_formed: u64,
}

#[derive(Debug, Clone, Copy)]
enum Membership {
    Waiting,
    Paired(PairId),
}

struct PairingSession {
    initiator: ConnectionHandle,
    responder: ConnectionHandle,
    created_at: DateTime<Utc>,
    call_log: Option<JoinHandle<Option<CallLogId>>>,
}

impl PairingSession {
    fn partner_of(&self, connection: ConnectionId) -> &ConnectionHandle {
        if self.initiator.id() == connection {
            &self.responder
        } else {
            &self.initiator
        }
    }
}

#[derive(Default)]
struct MatcherState {
    waiting: VecDeque<ConnectionHandle>,
    sessions: HashMap<PairId, PairingSession>,
    membership: HashMap<ConnectionId, Membership>,
    pairs_formed: u64,
}

/// Pairs anonymous participants for random calls.
pub struct RandomPairingMatcher {
    state: Mutex<MatcherState>,
    call_log: Arc<dyn CallLog>,
}

impl RandomPairingMatcher {
    /// Create a matcher that records pairings in `call_log`.
    #[must_use]
    pub fn new(call_log: Arc<dyn CallLog>) -> Self {
        Self {
            state: Mutex::new(MatcherState::default()),
            call_log,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MatcherState> {
        // State is kept consistent at every unlock, so a poisoned lock is usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `participant` to the wait queue and pair if possible.
    ///
    /// Must be called from within a Tokio runtime: the call-log entry for a
    /// new pairing is opened on a spawned task.
    pub fn join(&self, participant: ConnectionHandle) -> JoinOutcome {
        let mut state = self.lock();
        let connection = participant.id();

        if state.membership.contains_key(&connection) {
            return JoinOutcome::AlreadyJoined;
        }

        let joiner = participant.identity();
        state.membership.insert(connection, Membership::Waiting);
        state.waiting.push_back(participant);

        if state.waiting.len() < 2 {
            let position = state.waiting.len();
            debug!(connection = %connection, identity = %joiner, position, "Waiting for partner");
            return JoinOutcome::Waiting { position };
        }

        let (Some(initiator), Some(responder)) =
            (state.waiting.pop_front(), state.waiting.pop_front())
        else {
            unreachable!("wait queue underflow while pairing");
        };

        let pair_id = PairId::generate();
        let created_at = Utc::now();
        let call_log = self.open_call_log(&initiator, &responder, created_at);

        state
            .membership
            .insert(initiator.id(), Membership::Paired(pair_id));
        state
            .membership
            .insert(responder.id(), Membership::Paired(pair_id));
        state.pairs_formed += 1;

        for (handle, role) in [(&initiator, Role::Initiator), (&responder, Role::Responder)] {
            if let Err(e) = handle.send_frame(&Frame::match_found(pair_id, role)) {
                debug!(connection = %handle.id(), error = %e, "match-found not delivered");
            }
        }

        info!(
            pair = %pair_id,
            caller = %initiator.identity(),
            callee = %responder.identity(),
            "Paired"
        );

        let outcome = if initiator.id() == connection {
            PairInfo {
                pair_id,
                role: Role::Initiator,
                partner: responder.identity(),
            }
        } else {
            PairInfo {
                pair_id,
                role: Role::Responder,
                partner: initiator.identity(),
            }
        };

        state.sessions.insert(
            pair_id,
            PairingSession {
                initiator,
                responder,
                created_at,
                call_log: Some(call_log),
            },
        );

        JoinOutcome::Paired(outcome)
    }

    fn open_call_log(
        &self,
        initiator: &ConnectionHandle,
        responder: &ConnectionHandle,
        started_at: DateTime<Utc>,
    ) -> JoinHandle<Option<CallLogId>> {
        let call_log = Arc::clone(&self.call_log);
        let caller = initiator.identity();
        let callee = responder.identity();

        tokio::spawn(async move {
            match call_log
                .open(caller, callee, CallKind::Random, started_at)
                .await
            {
                Ok(id) => {
                    trace!(call = %id, "Call log opened");
                    Some(id)
                }
                Err(e) => {
                    warn!(caller = %caller, callee = %callee, error = %e, "Failed to open call log");
                    None
                }
            }
        })
    }

    /// Forward `raw` verbatim to the partner of `connection`.
    pub fn forward_in_pair(&self, connection: ConnectionId, raw: Arc<str>) -> Delivery {
        let state = self.lock();

        let Some(Membership::Paired(pair_id)) = state.membership.get(&connection) else {
            trace!(connection = %connection, "Not paired, dropping message");
            return Delivery::Dropped(DropReason::NotPaired);
        };
        let Some(session) = state.sessions.get(pair_id) else {
            return Delivery::Dropped(DropReason::NotPaired);
        };

        match session.partner_of(connection).send_text(raw) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Dropped(DropReason::RecipientClosed),
        }
    }

    /// Remove `connection` from the queue or tear down its pairing.
    ///
    /// The partner of a paired connection receives exactly one
    /// `peer-disconnected` and is not re-queued. Calling this again for the
    /// same connection, or for the partner, returns
    /// [`LeaveOutcome::NotPresent`].
    pub fn leave(&self, connection: ConnectionId) -> LeaveOutcome {
        let mut state = self.lock();

        let pair_id = match state.membership.remove(&connection) {
            None => return LeaveOutcome::NotPresent,
            Some(Membership::Waiting) => {
                state.waiting.retain(|handle| handle.id() != connection);
                debug!(connection = %connection, "Left wait queue");
                return LeaveOutcome::LeftQueue;
            }
            Some(Membership::Paired(pair_id)) => pair_id,
        };

        let Some(mut session) = state.sessions.remove(&pair_id) else {
            unreachable!("connection {connection} paired in {pair_id} without a session");
        };

        let partner = session.partner_of(connection).clone();
        state.membership.remove(&partner.id());

        let partner_notified = partner.send_frame(&Frame::PeerDisconnected).is_ok();
        let call_log = session.call_log.take();
        drop(state);

        let ended_at = Utc::now();
        info!(
            pair = %pair_id,
            connection = %connection,
            partner = %partner.identity(),
            duration_ms = (ended_at - session.created_at).num_milliseconds(),
            "Pairing ended"
        );

        if let Some(open) = call_log {
            self.close_call_log(open, ended_at);
        }

        LeaveOutcome::Unpaired {
            pair_id,
            partner_notified,
        }
    }

    fn close_call_log(&self, open: JoinHandle<Option<CallLogId>>, ended_at: DateTime<Utc>) {
        let call_log = Arc::clone(&self.call_log);

        tokio::spawn(async move {
            let id = match open.await {
                Ok(Some(id)) => id,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Call log open task failed");
                    return;
                }
            };
            if let Err(e) = call_log.close(id, ended_at).await {
                warn!(call = %id, error = %e, "Failed to close call log");
            }
        });
    }

    /// Get the partner of `connection`, if paired.
    #[must_use]
    pub fn partner_of(&self, connection: ConnectionId) -> Option<ConnectionHandle> {
        let state = self.lock();
        match state.membership.get(&connection)? {
            Membership::Paired(pair_id) => state
                .sessions
                .get(pair_id)
                .map(|session| session.partner_of(connection).clone()),
            Membership::Waiting => None,
        }
    }

    /// Check if `connection` is in the wait queue.
    #[must_use]
    pub fn is_waiting(&self, connection: ConnectionId) -> bool {
        matches!(
            self.lock().membership.get(&connection),
            Some(Membership::Waiting)
        )
    }

    /// Number of waiting participants.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Number of active pairings.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Get a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> MatcherStats {
        let state = self.lock();
        MatcherStats {
            waiting: state.waiting.len(),
            sessions: state.sessions.len(),
            pairs_formed: state.pairs_formed,
        }
    }
}
