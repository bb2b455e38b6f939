//! Room registry: live channel subscriptions per connection.
//!
//! Rooms are transient and keyed by connection, not identity. They are
//! separate from persisted channel membership and vanish when their last
//! connection leaves.

use std::collections::HashSet;

use dashmap::DashMap;
use parley_protocol::{ChannelId, ConnectionId};
use thiserror::Error;
use tracing::debug;

/// Default maximum number of rooms a single connection may join.
pub const DEFAULT_MAX_ROOMS_PER_CONNECTION: usize = 100;

/// Room registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// Connection already sits in the maximum number of rooms.
    #[error("Maximum rooms per connection reached ({0})")]
    LimitReached(usize),
}

/// Process-wide channel -> connections index.
///
/// Locks are always taken membership-first, room-second.
#[derive(Debug)]
pub struct RoomRegistry {
    /// Connections subscribed to each channel.
    rooms: DashMap<ChannelId, HashSet<ConnectionId>>,
    /// Channels each connection is subscribed to.
    memberships: DashMap<ConnectionId, HashSet<ChannelId>>,
    max_rooms_per_connection: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROOMS_PER_CONNECTION)
    }
}

impl RoomRegistry {
    #[must_use]
    pub fn new(max_rooms_per_connection: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            max_rooms_per_connection,
        }
    }

    /// Subscribe a connection to a channel's room.
    ///
    /// Returns `Ok(false)` if the connection was already in the room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is at its room limit.
    pub fn join(&self, channel: &ChannelId, connection: &ConnectionId) -> Result<bool, RoomError> {
        let mut joined = self.memberships.entry(connection.clone()).or_default();

        if joined.contains(channel) {
            return Ok(false);
        }
        if joined.len() >= self.max_rooms_per_connection {
            return Err(RoomError::LimitReached(self.max_rooms_per_connection));
        }

        let mut room = self.rooms.entry(channel.clone()).or_default();
        room.insert(connection.clone());
        joined.insert(channel.clone());

        debug!(
            channel = %channel,
            connection = %connection,
            members = room.len(),
            "Joined room"
        );
        Ok(true)
    }

    /// Remove a connection from one room.
    ///
    /// Returns `false` if it was not in the room.
    pub fn leave(&self, channel: &ChannelId, connection: &ConnectionId) -> bool {
        let removed = match self.memberships.get_mut(connection) {
            Some(mut joined) => joined.remove(channel),
            None => false,
        };
        if removed {
            self.drop_member(channel, connection);
            debug!(channel = %channel, connection = %connection, "Left room");
        }
        removed
    }

    /// Remove a connection from every room it joined.
    pub fn leave_all(&self, connection: &ConnectionId) {
        if let Some((_, joined)) = self.memberships.remove(connection) {
            for channel in &joined {
                self.drop_member(channel, connection);
            }
            debug!(connection = %connection, rooms = joined.len(), "Left all rooms");
        }
    }

    /// Connections subscribed to `channel`. Empty for unknown channels.
    #[must_use]
    pub fn members(&self, channel: &ChannelId) -> Vec<ConnectionId> {
        self.rooms
            .get(channel)
            .map(|room| room.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_member(&self, channel: &ChannelId, connection: &ConnectionId) -> bool {
        self.rooms
            .get(channel)
            .map_or(false, |room| room.contains(connection))
    }

    /// Channels a connection is subscribed to.
    #[must_use]
    pub fn rooms_of(&self, connection: &ConnectionId) -> Vec<ChannelId> {
        self.memberships
            .get(connection)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of non-empty rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn drop_member(&self, channel: &ChannelId, connection: &ConnectionId) {
        if let Some(mut room) = self.rooms.get_mut(channel) {
            room.remove(connection);
        }
        if self.rooms.remove_if(channel, |_, room| room.is_empty()).is_some() {
            debug!(channel = %channel, "Dropped empty room");
        }
    }
}
