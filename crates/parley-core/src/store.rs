//! Collaborator interfaces consumed by the engine.
//!
//! Token verification, the identity directory and persistence live outside
//! the live core. The router only talks to them through these traits, so any
//! storage engine can be plugged in; [`crate::memory`] provides in-process
//! implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_protocol::{ChannelId, MessageId, Reaction, ReadMarker, UserId, UserSummary};
use thiserror::Error;

use crate::channel::Channel;
use crate::message::{Message, NewMessage, Versioned};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not serve the request.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A record the operation depends on does not exist.
    #[error("Missing record: {0}")]
    MissingRecord(String),
}

/// Token verification errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token is malformed or its signature does not verify.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token was valid but has expired.
    #[error("Token expired")]
    Expired,
}

/// An authenticated user as known to the identity directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: None,
        }
    }

    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Result of a successful token verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

/// Verifies handshake tokens.
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` and return the identity it was issued for.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid or expired.
    fn verify_token(&self, token: &str) -> Result<VerifiedToken, AuthError>;
}

/// Looks up identities by id.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn fetch_identity(&self, id: &UserId) -> Result<Option<Identity>, StoreError>;
}

/// Outcome of a conditional sub-document write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied; the document is now at `version`.
    Written { version: u64 },
    /// The document changed since it was read; nothing was written.
    Stale,
    /// The document no longer exists.
    Missing,
}

/// Selection of messages for history and aggregate queries.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageQuery {
    /// Messages in a channel, optionally only those created at or after `since`.
    Channel {
        channel_id: ChannelId,
        since: Option<DateTime<Utc>>,
    },
    /// Direct messages exchanged between two users, in either direction.
    Direct { a: UserId, b: UserId },
    /// Messages `user_id` sent or received, plus every message in `channels`.
    Involving {
        user_id: UserId,
        channels: Vec<ChannelId>,
    },
}

/// Message persistence.
///
/// `reactions` and `read_by` are independently mutable fields guarded by the
/// document version: a write only lands if the version still matches the one
/// the caller read.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message, assigning its id and creation time.
    async fn create(&self, draft: NewMessage) -> Result<Message, StoreError>;

    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Versioned<Message>>, StoreError>;

    async fn update_reactions(
        &self,
        id: &MessageId,
        expected_version: u64,
        reactions: Vec<Reaction>,
    ) -> Result<WriteOutcome, StoreError>;

    async fn update_read_by(
        &self,
        id: &MessageId,
        expected_version: u64,
        read_by: Vec<ReadMarker>,
    ) -> Result<WriteOutcome, StoreError>;

    /// List matching messages, newest first.
    async fn list(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;
}

/// Channel persistence.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn find_channel(&self, id: &ChannelId) -> Result<Option<Channel>, StoreError>;

    /// Add `user` to the channel's persisted members. Idempotent.
    ///
    /// Returns `true` if the user was not a member before.
    async fn add_member(
        &self,
        id: &ChannelId,
        user: &UserId,
        joined_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn member_joined_at(
        &self,
        id: &ChannelId,
        user: &UserId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Channels `user` is a persisted member of.
    async fn channels_of(&self, user: &UserId) -> Result<Vec<ChannelId>, StoreError>;
}
