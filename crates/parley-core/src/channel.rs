//! Persisted channel model.
//!
//! A channel's persisted membership is independent of its live room: members
//! can be offline, and connections only receive room fan-out after joining.

use chrono::{DateTime, Utc};
use parley_protocol::{ChannelId, ChannelPayload, UserId};

/// A persisted member of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMember {
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

/// A persisted channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub description: Option<String>,
    pub created_by: UserId,
    pub members: Vec<ChannelMember>,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// Create a public channel with its creator as the first member.
    #[must_use]
    pub fn new(id: impl Into<ChannelId>, name: impl Into<String>, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            members: vec![ChannelMember {
                user_id: created_by.clone(),
                joined_at: now,
            }],
            created_by,
            is_private: false,
            created_at: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.is_private = true;
        self
    }

    /// Check whether `user` is a persisted member.
    #[must_use]
    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| &m.user_id == user)
    }

    /// When `user` joined, if they are a member.
    #[must_use]
    pub fn joined_at(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.members
            .iter()
            .find(|m| &m.user_id == user)
            .map(|m| m.joined_at)
    }

    /// Add `user` as a member unless already present.
    ///
    /// Returns `true` if the member was added.
    pub fn add_member(&mut self, user: &UserId, joined_at: DateTime<Utc>) -> bool {
        if self.has_member(user) {
            return false;
        }
        self.members.push(ChannelMember {
            user_id: user.clone(),
            joined_at,
        });
        true
    }

    #[must_use]
    pub fn to_payload(&self) -> ChannelPayload {
        ChannelPayload {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_by: self.created_by.clone(),
            is_private: self.is_private,
        }
    }
}
