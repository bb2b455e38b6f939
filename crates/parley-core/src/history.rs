//! Read-side queries over persisted messages.
//!
//! History pages, search and the per-conversation aggregates (unread counts,
//! last message times) all read the same message store the router writes.
//! Aggregates group messages by [`Conversation`], derived once per message
//! relative to the viewer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_protocol::{ChannelId, MessagePayload, UserId, UserSummary};
use serde::Serialize;
use tracing::trace;

use crate::message::{Message, MessageTarget};
use crate::store::{ChannelStore, MessageQuery, MessageStore, StoreError, UserDirectory};

/// Default page size for history queries.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Maximum number of search results.
pub const SEARCH_LIMIT: usize = 20;

/// The conversation a message belongs to, as seen by one viewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Conversation {
    Channel(ChannelId),
    /// Direct conversation with `peer`, whichever side sent the message.
    Direct(UserId),
}

impl Conversation {
    /// Derive the conversation of `message` from `viewer`'s side.
    #[must_use]
    pub fn of(message: &Message, viewer: &UserId) -> Self {
        match &message.target {
            MessageTarget::Channel(channel) => Conversation::Channel(channel.clone()),
            MessageTarget::Direct(recipient) if &message.sender == viewer => {
                Conversation::Direct(recipient.clone())
            }
            MessageTarget::Direct(_) => Conversation::Direct(message.sender.clone()),
        }
    }
}

/// Offset pagination, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub skip: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            skip: 0,
        }
    }
}

/// Unread messages per conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCounts {
    pub channels: BTreeMap<ChannelId, usize>,
    pub direct: BTreeMap<UserId, usize>,
}

/// Newest message time per conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageTimes {
    pub channels: BTreeMap<ChannelId, DateTime<Utc>>,
    pub direct: BTreeMap<UserId, DateTime<Utc>>,
}

/// History and aggregate queries.
#[derive(Clone)]
pub struct History {
    messages: Arc<dyn MessageStore>,
    channels: Arc<dyn ChannelStore>,
    users: Arc<dyn UserDirectory>,
}

impl History {
    #[must_use]
    pub fn new(
        messages: Arc<dyn MessageStore>,
        channels: Arc<dyn ChannelStore>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            messages,
            channels,
            users,
        }
    }

    /// Messages in `channel`, newest first.
    ///
    /// Members only see messages from the moment they joined.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn channel_messages(
        &self,
        channel: &ChannelId,
        viewer: &UserId,
        page: Page,
    ) -> Result<Vec<MessagePayload>, StoreError> {
        let since = self.channels.member_joined_at(channel, viewer).await?;
        let messages = self
            .messages
            .list(&MessageQuery::Channel {
                channel_id: channel.clone(),
                since,
            })
            .await?;
        self.populate(paginate(messages, page)).await
    }

    /// Direct messages between `a` and `b`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn direct_messages(
        &self,
        a: &UserId,
        b: &UserId,
        page: Page,
    ) -> Result<Vec<MessagePayload>, StoreError> {
        let messages = self
            .messages
            .list(&MessageQuery::Direct {
                a: a.clone(),
                b: b.clone(),
            })
            .await?;
        self.populate(paginate(messages, page)).await
    }

    /// Case-insensitive substring search over messages `viewer` sent or
    /// received, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn search(
        &self,
        viewer: &UserId,
        text: &str,
    ) -> Result<Vec<MessagePayload>, StoreError> {
        let needle = text.to_lowercase();
        let messages: Vec<Message> = self
            .messages
            .list(&MessageQuery::Involving {
                user_id: viewer.clone(),
                channels: Vec::new(),
            })
            .await?
            .into_iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .take(SEARCH_LIMIT)
            .collect();

        trace!(user = %viewer, results = messages.len(), "Search");
        self.populate(messages).await
    }

    /// Messages `viewer` received and has not read, per conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn unread_counts(&self, viewer: &UserId) -> Result<UnreadCounts, StoreError> {
        let mut counts = UnreadCounts::default();
        for message in self.involving(viewer).await? {
            if &message.sender == viewer || message.is_read_by(viewer) {
                continue;
            }
            match Conversation::of(&message, viewer) {
                Conversation::Channel(id) => *counts.channels.entry(id).or_default() += 1,
                Conversation::Direct(peer) => *counts.direct.entry(peer).or_default() += 1,
            }
        }
        Ok(counts)
    }

    /// Creation time of the newest message per conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn last_message_times(
        &self,
        viewer: &UserId,
    ) -> Result<LastMessageTimes, StoreError> {
        let mut times = LastMessageTimes::default();
        for message in self.involving(viewer).await? {
            let slot = match Conversation::of(&message, viewer) {
                Conversation::Channel(id) => times.channels.entry(id).or_insert(message.created_at),
                Conversation::Direct(peer) => times.direct.entry(peer).or_insert(message.created_at),
            };
            if message.created_at > *slot {
                *slot = message.created_at;
            }
        }
        Ok(times)
    }

    async fn involving(&self, viewer: &UserId) -> Result<Vec<Message>, StoreError> {
        let channels = self.channels.channels_of(viewer).await?;
        self.messages
            .list(&MessageQuery::Involving {
                user_id: viewer.clone(),
                channels,
            })
            .await
    }

    async fn populate(&self, messages: Vec<Message>) -> Result<Vec<MessagePayload>, StoreError> {
        let mut summaries: HashMap<UserId, UserSummary> = HashMap::new();
        let mut payloads = Vec::with_capacity(messages.len());

        for message in messages {
            let sender = self.summary(&mut summaries, &message.sender).await?;
            let recipient = match message.target.recipient_id() {
                Some(id) => Some(self.summary(&mut summaries, id).await?),
                None => None,
            };
            payloads.push(message.to_payload(sender, recipient));
        }
        Ok(payloads)
    }

    async fn summary(
        &self,
        cache: &mut HashMap<UserId, UserSummary>,
        id: &UserId,
    ) -> Result<UserSummary, StoreError> {
        if let Some(summary) = cache.get(id) {
            return Ok(summary.clone());
        }
        // Deleted users keep their id with an empty name.
        let summary = match self.users.fetch_identity(id).await? {
            Some(identity) => identity.summary(),
            None => UserSummary {
                id: id.clone(),
                username: String::new(),
            },
        };
        cache.insert(id.clone(), summary.clone());
        Ok(summary)
    }
}

fn paginate(messages: Vec<Message>, page: Page) -> Vec<Message> {
    messages
        .into_iter()
        .skip(page.skip)
        .take(page.limit)
        .collect()
}
