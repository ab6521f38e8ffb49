//! Registry of live direct-call connections.
//!
//! Maps each identity to its current connection. A newer connection for the
//! same identity replaces the older one; removal is compare-and-remove so a
//! late close of the old socket cannot evict the new registration.

use crate::connection::ConnectionHandle;
use dashmap::DashMap;
use tandem_protocol::ClientIdentity;
use tracing::debug;

/// Identity → current connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ClientIdentity, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handle` as the current connection for `identity`.
    ///
    /// Returns the superseded handle, if any. The superseded connection is
    /// not closed here; its next send fails once its task is gone.
    pub fn register(
        &self,
        identity: ClientIdentity,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let connection = handle.id();
        let previous = self.connections.insert(identity, handle);

        match &previous {
            Some(old) => debug!(
                identity = %identity,
                connection = %connection,
                superseded = %old.id(),
                "Registered, superseding previous connection"
            ),
            None => debug!(identity = %identity, connection = %connection, "Registered"),
        }

        previous
    }

    /// Get the current connection for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &ClientIdentity) -> Option<ConnectionHandle> {
        self.connections.get(identity).map(|entry| entry.value().clone())
    }

    /// Remove the mapping for `identity` only if it still points at `handle`.
    ///
    /// Returns `true` if the mapping was removed.
    pub fn remove(&self, identity: &ClientIdentity, handle: &ConnectionHandle) -> bool {
        let removed = self
            .connections
            .remove_if(identity, |_, current| current.id() == handle.id())
            .is_some();

        if removed {
            debug!(identity = %identity, connection = %handle.id(), "Deregistered");
        } else {
            debug!(
                identity = %identity,
                connection = %handle.id(),
                "Stale deregistration ignored"
            );
        }

        removed
    }

    /// Check if `identity` has a live registration.
    #[must_use]
    pub fn is_online(&self, identity: &ClientIdentity) -> bool {
        self.connections.contains_key(identity)
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no identity is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
