//! Inbound client events, outbound broadcasts and acknowledgements.
//!
//! Both event enums are adjacently tagged so every payload travels as
//! `{"event": "<name>", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ChannelId, MessageId, MessageKind, Reaction, ReadMarker, UserId, UserSummary,
};

/// An event sent by a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    SendMessage(SendMessage),
    JoinChannel(ChannelRef),
    LeaveChannel(ChannelRef),
    Typing(Typing),
    MessageReaction(ReactionRequest),
    MarkAsRead(MessageRef),
}

impl InboundEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::SendMessage(_) => "sendMessage",
            InboundEvent::JoinChannel(_) => "joinChannel",
            InboundEvent::LeaveChannel(_) => "leaveChannel",
            InboundEvent::Typing(_) => "typing",
            InboundEvent::MessageReaction(_) => "messageReaction",
            InboundEvent::MarkAsRead(_) => "markAsRead",
        }
    }
}

/// Payload of `sendMessage`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl SendMessage {
    /// A text message to a channel.
    #[must_use]
    pub fn to_channel(channel_id: impl Into<ChannelId>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            channel_id: Some(channel_id.into()),
            ..Self::default()
        }
    }

    /// A text message to a single user.
    #[must_use]
    pub fn to_user(recipient_id: impl Into<UserId>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            recipient_id: Some(recipient_id.into()),
            ..Self::default()
        }
    }
}

/// Payload of `joinChannel` and `leaveChannel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub channel_id: ChannelId,
}

/// Payload of `typing`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub is_typing: bool,
}

/// Payload of `messageReaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    pub message_id: MessageId,
    pub emoji: String,
}

/// Payload of `markAsRead`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: MessageId,
}

/// An event pushed by the server to one or more connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    NewMessage(MessagePayload),
    NewChannel(ChannelPayload),
    NewUser(UserPayload),
    UserStatusChange(UserStatusChange),
    UserJoinedChannel(UserJoinedChannel),
    UserTyping(UserTyping),
    MessageReactionUpdate(ReactionUpdate),
    MessageRead(MessageRead),
}

impl OutboundEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::NewMessage(_) => "newMessage",
            OutboundEvent::NewChannel(_) => "newChannel",
            OutboundEvent::NewUser(_) => "newUser",
            OutboundEvent::UserStatusChange(_) => "userStatusChange",
            OutboundEvent::UserJoinedChannel(_) => "userJoinedChannel",
            OutboundEvent::UserTyping(_) => "userTyping",
            OutboundEvent::MessageReactionUpdate(_) => "messageReactionUpdate",
            OutboundEvent::MessageRead(_) => "messageRead",
        }
    }
}

/// A message with its sender (and recipient, for direct messages) populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender: UserSummary,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserSummary>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    pub read_by: Vec<ReadMarker>,
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    pub id: ChannelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_by: UserId,
    pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub id: UserId,
    pub username: String,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusChange {
    pub user_id: UserId,
    pub username: String,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedChannel {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub user_id: UserId,
    pub username: String,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub message_id: MessageId,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub message_id: MessageId,
    pub read_by: UserId,
    pub read_at: DateTime<Utc>,
}

/// Structured reply to the connection that sent an inbound event.
///
/// A failed event is always `{success: false, error}`; successful events carry
/// whichever result fields apply to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Reaction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    /// A bare success acknowledgement.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A failure acknowledgement carrying a human-readable error.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: MessagePayload) -> Self {
        self.message = Some(message);
        self
    }

    #[must_use]
    pub fn with_reactions(mut self, reactions: Vec<Reaction>) -> Self {
        self.reactions = Some(reactions);
        self
    }

    #[must_use]
    pub fn with_read_at(mut self, read_at: DateTime<Utc>) -> Self {
        self.read_at = Some(read_at);
        self
    }
}
