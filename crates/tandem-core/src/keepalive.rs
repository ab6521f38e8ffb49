//! Connection liveness.
//!
//! Clients send a `ping` frame every 30 seconds. The framer recognises it and
//! the connection task calls [`KeepAliveSupervisor::touch`]; any other inbound
//! traffic counts as liveness too. With a timeout configured, the supervisor
//! closes connections that stay silent for longer than the timeout.

use crate::connection::{CloseReason, ConnectionHandle, ConnectionId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

struct Tracked {
    handle: ConnectionHandle,
    last_seen: Instant,
}

/// Records the last inbound activity of each connection.
pub struct KeepAliveSupervisor {
    timeout: Option<Duration>,
    tracked: DashMap<ConnectionId, Tracked>,
}

impl KeepAliveSupervisor {
    /// Create a supervisor. `None` disables reaping.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            tracked: DashMap::new(),
        }
    }

    /// Check if silent connections are reaped.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }

    /// Start tracking `handle`, seen now.
    pub fn track(&self, handle: &ConnectionHandle) {
        self.tracked.insert(
            handle.id(),
            Tracked {
                handle: handle.clone(),
                last_seen: Instant::now(),
            },
        );
    }

    /// Record inbound activity on `connection`.
    pub fn touch(&self, connection: ConnectionId) {
        if let Some(mut tracked) = self.tracked.get_mut(&connection) {
            tracked.last_seen = Instant::now();
        }
    }

    /// Stop tracking `connection`.
    pub fn forget(&self, connection: ConnectionId) {
        self.tracked.remove(&connection);
    }

    /// When `connection` last showed activity.
    #[must_use]
    pub fn last_seen(&self, connection: ConnectionId) -> Option<Instant> {
        self.tracked.get(&connection).map(|tracked| tracked.last_seen)
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Close and forget every connection silent for longer than the timeout.
    ///
    /// Returns the connections that were reaped. Does nothing when reaping
    /// is disabled.
    pub fn reap_expired(&self, now: Instant) -> Vec<ConnectionId> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };

        let expired: Vec<ConnectionId> = self
            .tracked
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > timeout)
            .map(|entry| *entry.key())
            .collect();

        for connection in &expired {
            if let Some((_, tracked)) = self.tracked.remove(connection) {
                info!(
                    connection = %connection,
                    identity = %tracked.handle.identity(),
                    "Heartbeat timeout, closing connection"
                );
                if tracked.handle.close(CloseReason::HeartbeatTimeout).is_err() {
                    debug!(connection = %connection, "Connection already gone");
                }
            }
        }

        expired
    }

    /// Run [`reap_expired`](Self::reap_expired) every `interval`.
    ///
    /// Returns `None` when reaping is disabled.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }

        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = supervisor.reap_expired(Instant::now());
                if !reaped.is_empty() {
                    debug!(count = reaped.len(), "Reaped silent connections");
                }
            }
        }))
    }
}
