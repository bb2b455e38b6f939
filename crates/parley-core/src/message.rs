//! Persisted message model and its mutable sub-documents.
//!
//! Reactions and read markers are plain vectors with set semantics enforced by
//! [`toggle_reaction`] and [`add_read_marker`]; the mutation coordinator applies
//! them to a freshly read copy before each conditional write.

use chrono::{DateTime, Utc};
use parley_protocol::{
    ChannelId, MessageId, MessageKind, MessagePayload, Reaction, ReadMarker, UserId, UserSummary,
};
use thiserror::Error;

/// Neither or both of channel and recipient were given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Exactly one of channelId or recipientId must be set")]
pub struct InvalidAddressing;

/// Where a message (or a typing notice) is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    /// Everyone subscribed to the channel's room.
    Channel(ChannelId),
    /// A single user.
    Direct(UserId),
}

impl MessageTarget {
    /// Resolve the addressing mode from the optional wire fields.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidAddressing`] unless exactly one field is set.
    pub fn resolve(
        channel_id: Option<ChannelId>,
        recipient_id: Option<UserId>,
    ) -> Result<Self, InvalidAddressing> {
        match (channel_id, recipient_id) {
            (Some(channel), None) => Ok(MessageTarget::Channel(channel)),
            (None, Some(recipient)) => Ok(MessageTarget::Direct(recipient)),
            _ => Err(InvalidAddressing),
        }
    }

    #[must_use]
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            MessageTarget::Channel(id) => Some(id),
            MessageTarget::Direct(_) => None,
        }
    }

    #[must_use]
    pub fn recipient_id(&self) -> Option<&UserId> {
        match self {
            MessageTarget::Channel(_) => None,
            MessageTarget::Direct(id) => Some(id),
        }
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: UserId,
    pub content: String,
    pub target: MessageTarget,
    pub kind: MessageKind,
    pub file_url: Option<String>,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub content: String,
    pub target: MessageTarget,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    /// Read markers in arrival order, at most one per user.
    pub read_by: Vec<ReadMarker>,
    /// Reactions, at most one per `(user, emoji)` pair.
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Materialize a draft with its store-assigned id and creation time.
    #[must_use]
    pub fn from_draft(draft: NewMessage, id: MessageId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            sender: draft.sender,
            content: draft.content,
            target: draft.target,
            kind: draft.kind,
            file_url: draft.file_url,
            read_by: Vec::new(),
            reactions: Vec::new(),
            created_at,
        }
    }

    /// Check whether `user` has a read marker on this message.
    #[must_use]
    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.iter().any(|marker| &marker.user_id == user)
    }

    /// Project the message onto the wire with populated sender and recipient.
    #[must_use]
    pub fn to_payload(&self, sender: UserSummary, recipient: Option<UserSummary>) -> MessagePayload {
        MessagePayload {
            id: self.id.clone(),
            sender,
            content: self.content.clone(),
            channel_id: self.target.channel_id().cloned(),
            recipient,
            kind: self.kind,
            file_url: self.file_url.clone(),
            read_by: self.read_by.clone(),
            reactions: self.reactions.clone(),
            created_at: self.created_at,
        }
    }
}

/// A value paired with the store version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Toggle `(user, emoji)` in a reaction set.
///
/// Returns `true` if the reaction was added, `false` if it was removed.
pub fn toggle_reaction(reactions: &mut Vec<Reaction>, user: &UserId, emoji: &str) -> bool {
    let before = reactions.len();
    reactions.retain(|r| !(&r.user_id == user && r.emoji == emoji));
    if reactions.len() < before {
        return false;
    }
    reactions.push(Reaction::new(user.clone(), emoji));
    true
}

/// Add a read marker for `user` unless one already exists.
///
/// Returns `true` if a marker was added.
pub fn add_read_marker(read_by: &mut Vec<ReadMarker>, user: &UserId, read_at: DateTime<Utc>) -> bool {
    if read_by.iter().any(|marker| &marker.user_id == user) {
        return false;
    }
    read_by.push(ReadMarker {
        user_id: user.clone(),
        read_at,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    #[test]
    fn test_resolve_addressing() {
        assert_eq!(
            MessageTarget::resolve(Some(ChannelId::new("c")), None),
            Ok(MessageTarget::Channel(ChannelId::new("c")))
        );
        assert_eq!(
            MessageTarget::resolve(None, Some(user("u"))),
            Ok(MessageTarget::Direct(user("u")))
        );
        assert_eq!(MessageTarget::resolve(None, None), Err(InvalidAddressing));
        assert_eq!(
            MessageTarget::resolve(Some(ChannelId::new("c")), Some(user("u"))),
            Err(InvalidAddressing)
        );
    }

    #[test]
    fn test_toggle_twice_is_net_noop() {
        let mut reactions = Vec::new();
        assert!(toggle_reaction(&mut reactions, &user("a"), "👍"));
        assert_eq!(reactions.len(), 1);
        assert!(!toggle_reaction(&mut reactions, &user("a"), "👍"));
        assert!(reactions.is_empty());
    }

    #[test]
    fn test_distinct_emojis_coexist() {
        let mut reactions = Vec::new();
        toggle_reaction(&mut reactions, &user("a"), "👍");
        toggle_reaction(&mut reactions, &user("a"), "🎉");
        toggle_reaction(&mut reactions, &user("b"), "👍");
        assert_eq!(reactions.len(), 3);

        toggle_reaction(&mut reactions, &user("a"), "👍");
        assert_eq!(
            reactions,
            vec![Reaction::new(user("a"), "🎉"), Reaction::new(user("b"), "👍")]
        );
    }

    #[test]
    fn test_read_marker_is_idempotent() {
        let mut read_by = Vec::new();
        let first = Utc::now();
        assert!(add_read_marker(&mut read_by, &user("a"), first));
        assert!(!add_read_marker(&mut read_by, &user("a"), Utc::now()));
        assert_eq!(read_by.len(), 1);
        assert_eq!(read_by[0].read_at, first);
    }

    #[test]
    fn test_payload_carries_addressing() {
        let draft = NewMessage {
            sender: user("a"),
            content: "hi".into(),
            target: MessageTarget::Channel(ChannelId::new("c")),
            kind: MessageKind::Text,
            file_url: None,
        };
        let message = Message::from_draft(draft, MessageId::new("m"), Utc::now());
        let payload = message.to_payload(
            UserSummary {
                id: user("a"),
                username: "alice".into(),
            },
            None,
        );
        assert_eq!(payload.channel_id, Some(ChannelId::new("c")));
        assert!(payload.recipient.is_none());
        assert_eq!(payload.sender.username, "alice");
    }
}
