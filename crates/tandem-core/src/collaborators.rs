//! External collaborators consumed by the relay.
//!
//! The relay never validates tokens, stores contacts or persists call logs
//! itself. It talks to those services through the traits below. In-memory
//! implementations are provided for tests and for single-node deployments
//! seeded from configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_protocol::{ClientIdentity, ContactSummary};
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The backing service cannot be reached.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// The referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Token resolution failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was supplied.
    #[error("Missing credential")]
    MissingCredential,

    /// The credential failed validation.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// The credential is valid but names no known principal.
    #[error("Unknown principal: {0}")]
    UnknownPrincipal(String),

    /// The principal could not be looked up.
    #[error(transparent)]
    Directory(#[from] CollaboratorError),
}

/// Resolves a bearer credential to an identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Resolve `credential`, called once per connection attempt.
    async fn resolve(&self, credential: &str) -> Result<ClientIdentity, AuthError>;
}

/// Source of accepted contact relationships.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Contacts with an accepted relationship to `identity`, in either direction.
    async fn accepted_contacts_of(
        &self,
        identity: &ClientIdentity,
    ) -> Result<Vec<ContactSummary>, CollaboratorError>;

    /// Display name of `identity`.
    async fn display_name(
        &self,
        identity: &ClientIdentity,
    ) -> Result<Option<String>, CollaboratorError>;
}

/// Maps login emails to identities.
#[async_trait]
pub trait PrincipalLookup: Send + Sync {
    /// Identity registered under `email`, compared case-insensitively.
    async fn identity_by_email(
        &self,
        email: &str,
    ) -> Result<Option<ClientIdentity>, CollaboratorError>;
}

/// Identifier of a call-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallLogId(Uuid);

impl CallLogId {
    /// Generate a fresh call-log ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Anonymous random pairing.
    Random,
}

impl CallKind {
    /// Name stored in the log.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Random => "random",
        }
    }
}

/// Sink for call start/end records.
#[async_trait]
pub trait CallLog: Send + Sync {
    /// Record the start of a call.
    async fn open(
        &self,
        caller: ClientIdentity,
        callee: ClientIdentity,
        kind: CallKind,
        started_at: DateTime<Utc>,
    ) -> Result<CallLogId, CollaboratorError>;

    /// Record the end of a call.
    async fn close(&self, id: CallLogId, ended_at: DateTime<Utc>)
        -> Result<(), CollaboratorError>;
}

/// Fixed token → identity table.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: DashMap<String, ClientIdentity>,
}

impl StaticTokens {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    pub fn insert(&self, token: impl Into<String>, identity: ClientIdentity) {
        self.tokens.insert(token.into(), identity);
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn resolve(&self, credential: &str) -> Result<ClientIdentity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .get(credential)
            .map(|entry| *entry.value())
            .ok_or_else(|| AuthError::InvalidCredential("unknown token".to_string()))
    }
}

/// State of a contact relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    /// Requested, not yet accepted.
    Pending,
    /// Both sides are contacts.
    Accepted,
}

/// A user known to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Display name.
    pub name: String,
    /// Login email.
    pub email: Option<String>,
}

/// In-memory contact directory.
///
/// Relationships are stored as directed `(user, friend)` edges. Presence
/// only follows accepted edges and treats them as undirected.
#[derive(Debug)]
pub struct MemoryDirectory {
    users: DashMap<ClientIdentity, UserRecord>,
    relationships: DashMap<(ClientIdentity, ClientIdentity), RelationshipStatus>,
    available: AtomicBool,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self {
            users: DashMap::new(),
            relationships: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn add_user(&self, identity: ClientIdentity, name: impl Into<String>, email: Option<String>) {
        self.users.insert(
            identity,
            UserRecord {
                name: name.into(),
                email,
            },
        );
    }

    /// Add or update a relationship from `user` to `friend`.
    pub fn add_relationship(
        &self,
        user: ClientIdentity,
        friend: ClientIdentity,
        status: RelationshipStatus,
    ) {
        self.relationships.insert((user, friend), status);
    }

    /// Find a user by email, case-insensitively.
    #[must_use]
    pub fn find_by_email(&self, email: &str) -> Option<ClientIdentity> {
        self.users.iter().find_map(|entry| {
            entry
                .value()
                .email
                .as_deref()
                .filter(|candidate| candidate.eq_ignore_ascii_case(email))
                .map(|_| *entry.key())
        })
    }

    /// Simulate the backing store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn ensure_available(&self) -> Result<(), CollaboratorError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CollaboratorError::Unavailable("directory offline".to_string()))
        }
    }

    fn name_of(&self, identity: &ClientIdentity) -> Option<String> {
        self.users.get(identity).map(|user| user.name.clone())
    }
}

#[async_trait]
impl ContactDirectory for MemoryDirectory {
    async fn accepted_contacts_of(
        &self,
        identity: &ClientIdentity,
    ) -> Result<Vec<ContactSummary>, CollaboratorError> {
        self.ensure_available()?;

        let mut seen = HashSet::new();
        let mut contacts = Vec::new();

        for entry in self.relationships.iter() {
            if *entry.value() != RelationshipStatus::Accepted {
                continue;
            }
            let (user, friend) = *entry.key();
            let other = if user == *identity {
                friend
            } else if friend == *identity {
                user
            } else {
                continue;
            };
            if other != *identity && seen.insert(other) {
                contacts.push(ContactSummary::new(other, self.name_of(&other)));
            }
        }

        Ok(contacts)
    }

    async fn display_name(
        &self,
        identity: &ClientIdentity,
    ) -> Result<Option<String>, CollaboratorError> {
        self.ensure_available()?;
        Ok(self.name_of(identity))
    }
}

#[async_trait]
impl PrincipalLookup for MemoryDirectory {
    async fn identity_by_email(
        &self,
        email: &str,
    ) -> Result<Option<ClientIdentity>, CollaboratorError> {
        self.ensure_available()?;
        Ok(self.find_by_email(email))
    }
}

/// One call-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Entry ID.
    pub id: CallLogId,
    /// Initiating side.
    pub caller: ClientIdentity,
    /// Receiving side.
    pub callee: ClientIdentity,
    /// Call kind.
    pub kind: CallKind,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call ended, if it has.
    pub ended_at: Option<DateTime<Utc>>,
}

/// In-memory call log.
#[derive(Debug, Default)]
pub struct MemoryCallLog {
    records: DashMap<CallLogId, CallRecord>,
}

impl MemoryCallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<CallRecord> {
        let mut records: Vec<CallRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.started_at);
        records
    }

    /// Number of calls that have not ended.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.ended_at.is_none())
            .count()
    }
}

#[async_trait]
impl CallLog for MemoryCallLog {
    async fn open(
        &self,
        caller: ClientIdentity,
        callee: ClientIdentity,
        kind: CallKind,
        started_at: DateTime<Utc>,
    ) -> Result<CallLogId, CollaboratorError> {
        let id = CallLogId::generate();
        self.records.insert(
            id,
            CallRecord {
                id,
                caller,
                callee,
                kind,
                started_at,
                ended_at: None,
            },
        );
        Ok(id)
    }

    async fn close(
        &self,
        id: CallLogId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))?;
        record.ended_at = Some(ended_at);
        Ok(())
    }
}

/// Call log that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallLog;

#[async_trait]
impl CallLog for NullCallLog {
    async fn open(
        &self,
        _caller: ClientIdentity,
        _callee: ClientIdentity,
        _kind: CallKind,
        _started_at: DateTime<Utc>,
    ) -> Result<CallLogId, CollaboratorError> {
        Ok(CallLogId::generate())
    }

    async fn close(
        &self,
        _id: CallLogId,
        _ended_at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tokens() {
        let tokens = StaticTokens::new();
        let identity = ClientIdentity::generate();
        tokens.insert("secret", identity);

        assert_eq!(tokens.resolve("secret").await.unwrap(), identity);
        assert!(matches!(
            tokens.resolve("").await,
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            tokens.resolve("other").await,
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_follows_accepted_edges_both_ways() {
        let directory = MemoryDirectory::new();
        let me = ClientIdentity::generate();
        let alice = ClientIdentity::generate();
        let bob = ClientIdentity::generate();
        let carol = ClientIdentity::generate();
        directory.add_user(me, "me", None);
        directory.add_user(alice, "alice", None);
        directory.add_user(bob, "bob", None);

        directory.add_relationship(me, alice, RelationshipStatus::Accepted);
        directory.add_relationship(bob, me, RelationshipStatus::Accepted);
        directory.add_relationship(me, carol, RelationshipStatus::Pending);
        // Reverse duplicate of an existing edge.
        directory.add_relationship(alice, me, RelationshipStatus::Accepted);

        let mut contacts = directory.accepted_contacts_of(&me).await.unwrap();
        contacts.sort_by(|a, b| a.contact_name.cmp(&b.contact_name));

        assert_eq!(
            contacts,
            vec![
                ContactSummary::new(alice, Some("alice".into())),
                ContactSummary::new(bob, Some("bob".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_directory_unavailable() {
        let directory = MemoryDirectory::new();
        directory.set_available(false);

        let result = directory
            .accepted_contacts_of(&ClientIdentity::generate())
            .await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
    }

    #[test]
    fn test_find_by_email() {
        let directory = MemoryDirectory::new();
        let identity = ClientIdentity::generate();
        directory.add_user(identity, "whale", Some("Whale@Example.com".into()));

        assert_eq!(directory.find_by_email("whale@example.com"), Some(identity));
        assert_eq!(directory.find_by_email("nobody@example.com"), None);
    }

    #[tokio::test]
    async fn test_principal_lookup() {
        let directory = MemoryDirectory::new();
        let identity = ClientIdentity::generate();
        directory.add_user(identity, "whale", Some("whale@example.com".into()));

        assert_eq!(
            directory.identity_by_email("WHALE@example.com").await.unwrap(),
            Some(identity)
        );

        directory.set_available(false);
        assert!(matches!(
            directory.identity_by_email("whale@example.com").await,
            Err(CollaboratorError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_call_log_open_close() {
        let log = MemoryCallLog::new();
        let caller = ClientIdentity::generate();
        let callee = ClientIdentity::generate();

        let id = log
            .open(caller, callee, CallKind::Random, Utc::now())
            .await
            .unwrap();
        assert_eq!(log.open_count(), 1);

        log.close(id, Utc::now()).await.unwrap();
        assert_eq!(log.open_count(), 0);

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind.as_str(), "random");
        assert!(records[0].ended_at.is_some());

        assert!(matches!(
            log.close(CallLogId::generate(), Utc::now()).await,
            Err(CollaboratorError::NotFound(_))
        ));
    }
}
