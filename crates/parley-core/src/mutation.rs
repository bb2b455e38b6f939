//! Mutation coordinator for reactions and read markers.
//!
//! Each mutation reads the current document, computes the new sub-document
//! from that fresh copy and writes it back conditionally on the version it
//! read. A stale write is retried from a new read, so concurrent toggles from
//! different users on the same message all survive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_protocol::{MessageId, UserId};
use thiserror::Error;
use tracing::{debug, trace};

use crate::message::{add_read_marker, toggle_reaction, Message};
use crate::store::{MessageStore, StoreError, WriteOutcome};

/// Default number of read-compute-write attempts per mutation.
pub const DEFAULT_MUTATION_ATTEMPTS: usize = 8;

/// Mutation errors.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The message does not exist.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// Every attempt lost the race against a concurrent writer.
    #[error("Too much contention on message {0}")]
    Contention(MessageId),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a reaction toggle.
#[derive(Debug, Clone)]
pub struct ReactionOutcome {
    /// `true` if the reaction was added, `false` if it was removed.
    pub added: bool,
    /// The message as written.
    pub message: Message,
}

/// Result of a read marker request.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// `false` if the user had already read the message.
    pub applied: bool,
    /// When the user's marker was (or had been) recorded.
    pub read_at: DateTime<Utc>,
    /// The message as written.
    pub message: Message,
}

/// Applies reaction and read-marker mutations.
#[derive(Clone)]
pub struct MutationCoordinator {
    messages: Arc<dyn MessageStore>,
    max_attempts: usize,
}

impl MutationCoordinator {
    #[must_use]
    pub fn new(messages: Arc<dyn MessageStore>, max_attempts: usize) -> Self {
        Self {
            messages,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Toggle `(user, emoji)` on a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not exist, the store fails, or
    /// every attempt was beaten by a concurrent write.
    pub async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<ReactionOutcome, MutationError> {
        for attempt in 1..=self.max_attempts {
            let current = self
                .messages
                .find_by_id(message_id)
                .await?
                .ok_or_else(|| MutationError::NotFound(message_id.clone()))?;

            let mut message = current.value;
            let added = toggle_reaction(&mut message.reactions, user, emoji);

            match self
                .messages
                .update_reactions(message_id, current.version, message.reactions.clone())
                .await?
            {
                WriteOutcome::Written { .. } => {
                    debug!(message = %message_id, user = %user, emoji, added, "Reaction toggled");
                    return Ok(ReactionOutcome { added, message });
                }
                WriteOutcome::Stale => {
                    trace!(message = %message_id, attempt, "Reaction write raced, retrying");
                }
                WriteOutcome::Missing => return Err(MutationError::NotFound(message_id.clone())),
            }
        }

        Err(MutationError::Contention(message_id.clone()))
    }

    /// Record that `user` has read a message.
    ///
    /// A second call for the same user is a no-op with `applied: false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not exist, the store fails, or
    /// every attempt was beaten by a concurrent write.
    pub async fn mark_read(
        &self,
        message_id: &MessageId,
        user: &UserId,
    ) -> Result<ReadOutcome, MutationError> {
        for attempt in 1..=self.max_attempts {
            let current = self
                .messages
                .find_by_id(message_id)
                .await?
                .ok_or_else(|| MutationError::NotFound(message_id.clone()))?;

            let mut message = current.value;
            if let Some(existing) = message.read_by.iter().find(|m| &m.user_id == user) {
                return Ok(ReadOutcome {
                    applied: false,
                    read_at: existing.read_at,
                    message,
                });
            }

            let read_at = Utc::now();
            add_read_marker(&mut message.read_by, user, read_at);

            match self
                .messages
                .update_read_by(message_id, current.version, message.read_by.clone())
                .await?
            {
                WriteOutcome::Written { .. } => {
                    debug!(message = %message_id, user = %user, "Marked read");
                    return Ok(ReadOutcome {
                        applied: true,
                        read_at,
                        message,
                    });
                }
                WriteOutcome::Stale => {
                    trace!(message = %message_id, attempt, "Read marker write raced, retrying");
                }
                WriteOutcome::Missing => return Err(MutationError::NotFound(message_id.clone())),
            }
        }

        Err(MutationError::Contention(message_id.clone()))
    }
}
