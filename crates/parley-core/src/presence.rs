//! Presence tracking for Parley.
//!
//! Turns session store transitions into `userStatusChange` broadcasts. Every
//! transition produces exactly one broadcast, emitted while the session
//! store still holds that identity's record.

use std::sync::Arc;

use parley_protocol::{OutboundEvent, UserPayload, UserStatusChange};
use tracing::debug;

use crate::outbox::Outbox;
use crate::session::PresenceTransition;
use crate::store::Identity;

/// Broadcasts presence changes to every live connection.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    outbox: Arc<Outbox>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }

    /// Broadcast one transition.
    ///
    /// Returns the number of connections it was queued for.
    pub fn publish(&self, transition: &PresenceTransition) -> usize {
        let event = Arc::new(OutboundEvent::UserStatusChange(status_change(transition)));
        let recipients = self.outbox.broadcast(&event);

        debug!(
            user = %transition.identity().id,
            online = matches!(transition, PresenceTransition::WentOnline { .. }),
            recipients,
            "Presence broadcast"
        );
        recipients
    }

    /// Announce a newly registered user, who starts out offline.
    pub fn announce(&self, identity: &Identity) -> usize {
        let event = Arc::new(OutboundEvent::NewUser(UserPayload {
            id: identity.id.clone(),
            username: identity.username.clone(),
            is_online: false,
        }));
        self.outbox.broadcast(&event)
    }
}

fn status_change(transition: &PresenceTransition) -> UserStatusChange {
    match transition {
        PresenceTransition::WentOnline { identity } => UserStatusChange {
            user_id: identity.id.clone(),
            username: identity.username.clone(),
            is_online: true,
            last_seen: None,
        },
        PresenceTransition::WentOffline {
            identity,
            last_seen,
        } => UserStatusChange {
            user_id: identity.id.clone(),
            username: identity.username.clone(),
            is_online: false,
            last_seen: Some(*last_seen),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::outbound_channel;
    use chrono::Utc;
    use parley_protocol::ConnectionId;

    #[test]
    fn test_transitions_are_broadcast_in_order() {
        let outbox = Arc::new(Outbox::new());
        let (tx, mut rx) = outbound_channel();
        outbox.attach(ConnectionId::new("watcher"), tx);
        let tracker = PresenceTracker::new(Arc::clone(&outbox));

        let identity = Identity::new("bob", "Bob");
        let last_seen = Utc::now();
        tracker.publish(&PresenceTransition::WentOnline {
            identity: identity.clone(),
        });
        tracker.publish(&PresenceTransition::WentOffline {
            identity,
            last_seen,
        });

        match rx.try_recv().unwrap().as_ref() {
            OutboundEvent::UserStatusChange(change) => {
                assert!(change.is_online);
                assert!(change.last_seen.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap().as_ref() {
            OutboundEvent::UserStatusChange(change) => {
                assert!(!change.is_online);
                assert_eq!(change.last_seen, Some(last_seen));
                assert_eq!(change.username, "Bob");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
