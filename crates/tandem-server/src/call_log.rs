//! Call log backed by the tracing pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tandem_core::{CallKind, CallLog, CallLogId, CollaboratorError};
use tandem_protocol::ClientIdentity;
use tracing::info;

#[derive(Debug)]
struct OpenCall {
    caller: ClientIdentity,
    callee: ClientIdentity,
    kind: CallKind,
    started_at: DateTime<Utc>,
}

/// Emits one `info!` event per call start and end.
///
/// Only calls still in progress are held, so the end event can carry the
/// duration. An entry is dropped as soon as its call closes.
#[derive(Debug, Default)]
pub struct TracingCallLog {
    open: DashMap<CallLogId, OpenCall>,
}

impl TracingCallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls started and not yet ended.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

#[async_trait]
impl CallLog for TracingCallLog {
    async fn open(
        &self,
        caller: ClientIdentity,
        callee: ClientIdentity,
        kind: CallKind,
        started_at: DateTime<Utc>,
    ) -> Result<CallLogId, CollaboratorError> {
        let id = CallLogId::generate();
        self.open.insert(
            id,
            OpenCall {
                caller,
                callee,
                kind,
                started_at,
            },
        );
        info!(
            call = %id,
            kind = kind.as_str(),
            caller = %caller,
            callee = %callee,
            started_at = %started_at.to_rfc3339(),
            "Call started"
        );
        Ok(id)
    }

    async fn close(
        &self,
        id: CallLogId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        let (_, call) = self
            .open
            .remove(&id)
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))?;
        let duration_ms = (ended_at - call.started_at).num_milliseconds().max(0);
        info!(
            call = %id,
            kind = call.kind.as_str(),
            caller = %call.caller,
            callee = %call.callee,
            ended_at = %ended_at.to_rfc3339(),
            duration_ms,
            "Call ended"
        );
        Ok(())
    }
}
