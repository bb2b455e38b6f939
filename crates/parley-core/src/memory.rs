//! In-process collaborator implementations.
//!
//! [`MemoryStore`] implements the identity directory and both persistence
//! traits on top of `DashMap`s. Per-document writes are serialized by the
//! map's shard lock and guarded by a version counter, which gives the
//! conditional-write semantics the mutation coordinator relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parley_protocol::{ChannelId, MessageId, Reaction, ReadMarker, UserId};
use tracing::trace;

use crate::channel::Channel;
use crate::message::{Message, NewMessage, Versioned};
use crate::store::{
    AuthError, ChannelStore, Identity, MessageQuery, MessageStore, StoreError, TokenVerifier,
    UserDirectory, VerifiedToken, WriteOutcome,
};

struct StoredMessage {
    seq: u64,
    version: u64,
    message: Message,
}

/// In-memory users, channels and messages.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<UserId, Identity>,
    channels: DashMap<ChannelId, Channel>,
    messages: DashMap<MessageId, StoredMessage>,
    sequence: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user.
    pub fn insert_user(&self, identity: Identity) {
        self.users.insert(identity.id.clone(), identity);
    }

    /// Insert or replace a channel.
    pub fn insert_channel(&self, channel: Channel) {
        self.channels.insert(channel.id.clone(), channel);
    }

    /// Number of persisted messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn conditional_write(
        &self,
        id: &MessageId,
        expected_version: u64,
        apply: impl FnOnce(&mut Message),
    ) -> WriteOutcome {
        let Some(mut stored) = self.messages.get_mut(id) else {
            return WriteOutcome::Missing;
        };
        if stored.version != expected_version {
            trace!(message = %id, expected_version, actual = stored.version, "Stale write rejected");
            return WriteOutcome::Stale;
        }
        apply(&mut stored.message);
        stored.version += 1;
        WriteOutcome::Written {
            version: stored.version,
        }
    }
}

fn query_matches(query: &MessageQuery, message: &Message) -> bool {
    match query {
        MessageQuery::Channel { channel_id, since } => {
            message.target.channel_id() == Some(channel_id)
                && since.map_or(true, |since| message.created_at >= since)
        }
        MessageQuery::Direct { a, b } => match message.target.recipient_id() {
            Some(recipient) => {
                (&message.sender == a && recipient == b) || (&message.sender == b && recipient == a)
            }
            None => false,
        },
        MessageQuery::Involving { user_id, channels } => {
            &message.sender == user_id
                || message.target.recipient_id() == Some(user_id)
                || message
                    .target
                    .channel_id()
                    .map_or(false, |channel| channels.contains(channel))
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn fetch_identity(&self, id: &UserId) -> Result<Option<Identity>, StoreError> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, draft: NewMessage) -> Result<Message, StoreError> {
        let message = Message::from_draft(draft, MessageId::generate(), Utc::now());
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.messages.insert(
            message.id.clone(),
            StoredMessage {
                seq,
                version: 0,
                message: message.clone(),
            },
        );
        Ok(message)
    }

    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Versioned<Message>>, StoreError> {
        Ok(self.messages.get(id).map(|stored| Versioned {
            version: stored.version,
            value: stored.message.clone(),
        }))
    }

    async fn update_reactions(
        &self,
        id: &MessageId,
        expected_version: u64,
        reactions: Vec<Reaction>,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(self.conditional_write(id, expected_version, |m| m.reactions = reactions))
    }

    async fn update_read_by(
        &self,
        id: &MessageId,
        expected_version: u64,
        read_by: Vec<ReadMarker>,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(self.conditional_write(id, expected_version, |m| m.read_by = read_by))
    }

    async fn list(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        let mut found: Vec<(u64, Message)> = self
            .messages
            .iter()
            .filter(|entry| query_matches(query, &entry.message))
            .map(|entry| (entry.seq, entry.message.clone()))
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, message)| message).collect())
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn find_channel(&self, id: &ChannelId) -> Result<Option<Channel>, StoreError> {
        Ok(self.channels.get(id).map(|c| c.clone()))
    }

    async fn add_member(
        &self,
        id: &ChannelId,
        user: &UserId,
        joined_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut channel = self
            .channels
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingRecord(format!("channel {id}")))?;
        Ok(channel.add_member(user, joined_at))
    }

    async fn member_joined_at(
        &self,
        id: &ChannelId,
        user: &UserId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.channels.get(id).and_then(|c| c.joined_at(user)))
    }

    async fn channels_of(&self, user: &UserId) -> Result<Vec<ChannelId>, StoreError> {
        Ok(self
            .channels
            .iter()
            .filter(|c| c.has_member(user))
            .map(|c| c.id.clone())
            .collect())
    }
}

/// Token verifier backed by a fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<UserId>) -> Self {
        self.tokens.insert(token.into(), user.into());
        self
    }
}

impl TokenVerifier for StaticTokens {
    fn verify_token(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        self.tokens
            .get(token)
            .map(|user_id| VerifiedToken {
                user_id: user_id.clone(),
                expires_at: Utc::now() + Duration::hours(1),
            })
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}
