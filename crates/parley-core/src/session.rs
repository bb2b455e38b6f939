//! Session store: which live connection speaks for each identity.
//!
//! An identity has at most one presence-authoritative connection. A new
//! registration supersedes the previous one, and a disconnect only takes the
//! identity offline if it comes from the connection that is still current.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{ConnectionId, UserId};
use tracing::debug;

use crate::store::Identity;

/// One authenticated live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub authenticated_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection with a freshly generated id.
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            id: ConnectionId::generate(),
            identity,
            authenticated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.identity.id
    }
}

/// Online state of one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub identity: Identity,
    /// Current connection, absent while offline.
    pub connection: Option<ConnectionId>,
    pub online: bool,
    /// When the identity last went offline. Meaningful only while offline.
    pub last_seen: Option<DateTime<Utc>>,
}

/// A change in an identity's online state.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceTransition {
    WentOnline {
        identity: Identity,
    },
    WentOffline {
        identity: Identity,
        last_seen: DateTime<Utc>,
    },
}

impl PresenceTransition {
    #[must_use]
    pub fn identity(&self) -> &Identity {
        match self {
            PresenceTransition::WentOnline { identity }
            | PresenceTransition::WentOffline { identity, .. } => identity,
        }
    }
}

/// Process-wide map from identity to its current connection.
#[derive(Debug, Default)]
pub struct SessionStore {
    /// Presence records indexed by identity.
    records: DashMap<UserId, PresenceRecord>,
    /// Owning identity of every registered connection.
    owners: DashMap<ConnectionId, UserId>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connection` the current connection of its identity.
    ///
    /// Always succeeds; any previous connection stops being current.
    /// `publish` runs while the identity's record is still locked, so
    /// transitions of one identity are observed in the order they were applied.
    pub fn register<F>(&self, connection: &Connection, publish: F) -> PresenceTransition
    where
        F: FnOnce(&PresenceTransition),
    {
        let user_id = connection.user_id().clone();

        let mut record = self
            .records
            .entry(user_id.clone())
            .or_insert_with(|| PresenceRecord {
                identity: connection.identity.clone(),
                connection: None,
                online: false,
                last_seen: None,
            });
        record.identity = connection.identity.clone();
        record.online = true;
        let superseded = record.connection.replace(connection.id.clone());
        self.owners.insert(connection.id.clone(), user_id.clone());

        if let Some(previous) = superseded {
            debug!(user = %user_id, previous = %previous, current = %connection.id, "Connection superseded");
        } else {
            debug!(user = %user_id, connection = %connection.id, "Registered");
        }

        let transition = PresenceTransition::WentOnline {
            identity: connection.identity.clone(),
        };
        publish(&transition);
        drop(record);

        transition
    }

    /// Forget `connection_id`.
    ///
    /// Returns `None` if the connection is unknown or no longer current for
    /// its identity (a stale disconnect after a faster reconnect). `publish`
    /// only runs when a transition is produced, under the record lock.
    pub fn unregister<F>(&self, connection_id: &ConnectionId, publish: F) -> Option<PresenceTransition>
    where
        F: FnOnce(&PresenceTransition),
    {
        let (_, user_id) = self.owners.remove(connection_id)?;
        let mut record = self.records.get_mut(&user_id)?;

        if record.connection.as_ref() != Some(connection_id) {
            debug!(user = %user_id, connection = %connection_id, "Stale disconnect ignored");
            return None;
        }

        let now = Utc::now();
        record.connection = None;
        record.online = false;
        record.last_seen = Some(now);
        debug!(user = %user_id, connection = %connection_id, "Unregistered");

        let transition = PresenceTransition::WentOffline {
            identity: record.identity.clone(),
            last_seen: now,
        };
        publish(&transition);
        drop(record);

        Some(transition)
    }

    /// Current connection of `user`, if online.
    #[must_use]
    pub fn lookup_connection(&self, user: &UserId) -> Option<ConnectionId> {
        self.records.get(user).and_then(|r| r.connection.clone())
    }

    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.records.get(user).map_or(false, |r| r.online)
    }

    /// Snapshot of the presence record for `user`.
    #[must_use]
    pub fn presence(&self, user: &UserId) -> Option<PresenceRecord> {
        self.records.get(user).map(|r| r.clone())
    }

    /// Identities that are currently online.
    #[must_use]
    pub fn online_users(&self) -> Vec<Identity> {
        self.records
            .iter()
            .filter(|r| r.online)
            .map(|r| r.identity.clone())
            .collect()
    }

    /// Number of identities currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.records.iter().filter(|r| r.online).count()
    }
}
