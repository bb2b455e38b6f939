//! Event router for Parley.
//!
//! The router owns the live state of the hub (sessions, rooms, outbound
//! queues) and is the single entry point for connection lifecycle and
//! inbound events. Every event produces exactly one [`Ack`] for the
//! originating connection; failures never reach other connections.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parley_protocol::{
    Ack, ChannelId, ChannelRef, ConnectionId, InboundEvent, MessageId, MessageKind, MessageRead,
    MessageRef, OutboundEvent, ReactionRequest, ReactionUpdate, SendMessage, Typing,
    UserJoinedChannel, UserTyping,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::memory::MemoryStore;
use crate::message::{InvalidAddressing, MessageTarget, NewMessage};
use crate::mutation::{MutationCoordinator, MutationError, DEFAULT_MUTATION_ATTEMPTS};
use crate::outbox::{OutboundSender, Outbox};
use crate::presence::PresenceTracker;
use crate::rooms::{RoomError, RoomRegistry, DEFAULT_MAX_ROOMS_PER_CONNECTION};
use crate::session::{Connection, SessionStore};
use crate::store::{ChannelStore, Identity, MessageStore, StoreError, TokenVerifier, UserDirectory};

/// Default maximum message content length, in characters.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 4096;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Handshake token missing or rejected.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Neither or both of channel and recipient were given.
    #[error(transparent)]
    InvalidAddressing(#[from] InvalidAddressing),

    /// Referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Text message without content.
    #[error("Message content must not be empty")]
    EmptyContent,

    /// Content exceeds the configured length.
    #[error("Message content exceeds {0} characters")]
    ContentTooLong(usize),

    #[error(transparent)]
    RoomLimitReached(#[from] RoomError),

    /// Concurrent writers kept invalidating the mutation.
    #[error("Message {0} is busy, try again")]
    Contention(MessageId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<MutationError> for RouterError {
    fn from(err: MutationError) -> Self {
        match err {
            MutationError::NotFound(_) => RouterError::NotFound("Message"),
            MutationError::Contention(id) => RouterError::Contention(id),
            MutationError::Store(err) => RouterError::Store(err),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
    /// Maximum message content length, in characters.
    pub max_content_length: usize,
    /// Read-compute-write attempts per reaction or read marker.
    pub mutation_attempts: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: DEFAULT_MAX_ROOMS_PER_CONNECTION,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            mutation_attempts: DEFAULT_MUTATION_ATTEMPTS,
        }
    }
}

/// External services the router depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn TokenVerifier>,
    pub users: Arc<dyn UserDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub channels: Arc<dyn ChannelStore>,
}

impl Collaborators {
    /// Use one [`MemoryStore`] for users, messages and channels.
    #[must_use]
    pub fn in_memory(store: Arc<MemoryStore>, tokens: Arc<dyn TokenVerifier>) -> Self {
        Self {
            tokens,
            users: store.clone(),
            messages: store.clone(),
            channels: store,
        }
    }
}

/// The central event router.
pub struct Router {
    collaborators: Collaborators,
    sessions: Arc<SessionStore>,
    rooms: Arc<RoomRegistry>,
    outbox: Arc<Outbox>,
    presence: PresenceTracker,
    mutations: MutationCoordinator,
    config: RouterConfig,
}

impl Router {
    /// Create a router with fresh session and room state.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: RouterConfig) -> Self {
        let rooms = Arc::new(RoomRegistry::new(config.max_rooms_per_connection));
        Self::with_state(collaborators, Arc::new(SessionStore::new()), rooms, config)
    }

    /// Create a router around existing session and room state.
    #[must_use]
    pub fn with_state(
        collaborators: Collaborators,
        sessions: Arc<SessionStore>,
        rooms: Arc<RoomRegistry>,
        config: RouterConfig,
    ) -> Self {
        info!("Creating router with config: {:?}", config);
        let outbox = Arc::new(Outbox::new());
        let mutations =
            MutationCoordinator::new(Arc::clone(&collaborators.messages), config.mutation_attempts);
        Self {
            presence: PresenceTracker::new(Arc::clone(&outbox)),
            collaborators,
            sessions,
            rooms,
            outbox,
            mutations,
            config,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connection_count: self.outbox.len(),
            online_users: self.sessions.online_count(),
            room_count: self.rooms.room_count(),
        }
    }

    /// Authenticate a new connection and bring its identity online.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Unauthenticated`] if the token is missing or
    /// invalid or names an unknown identity.
    pub async fn connect(
        &self,
        token: Option<&str>,
        sender: OutboundSender,
    ) -> Result<Connection, RouterError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RouterError::Unauthenticated("missing token".into()))?;

        let verified = self
            .collaborators
            .tokens
            .verify_token(token)
            .map_err(|e| RouterError::Unauthenticated(e.to_string()))?;

        let identity = self
            .collaborators
            .users
            .fetch_identity(&verified.user_id)
            .await?
            .ok_or_else(|| RouterError::Unauthenticated("unknown user".into()))?;

        let connection = Connection::new(identity);
        self.outbox.attach(connection.id.clone(), sender);
        self.sessions.register(&connection, |transition| {
            self.presence.publish(transition);
        });

        debug!(connection = %connection.id, user = %connection.user_id(), "Connected");
        Ok(connection)
    }

    /// Tear down a connection's live state.
    pub fn disconnect(&self, connection: &Connection) {
        self.rooms.leave_all(&connection.id);
        self.outbox.detach(&connection.id);
        self.sessions.unregister(&connection.id, |transition| {
            self.presence.publish(transition);
        });
        debug!(connection = %connection.id, user = %connection.user_id(), "Disconnected");
    }

    /// Handle one inbound event and produce its acknowledgement.
    pub async fn handle(&self, connection: &Connection, event: InboundEvent) -> Ack {
        let name = event.name();
        let result = match event {
            InboundEvent::SendMessage(send) => self.send_message(connection, send).await,
            InboundEvent::JoinChannel(ChannelRef { channel_id }) => {
                self.join_channel(connection, channel_id).await
            }
            InboundEvent::LeaveChannel(ChannelRef { channel_id }) => {
                Ok(self.leave_channel(connection, &channel_id))
            }
            InboundEvent::Typing(typing) => self.typing(connection, typing),
            InboundEvent::MessageReaction(request) => self.react(connection, request).await,
            InboundEvent::MarkAsRead(MessageRef { message_id }) => {
                self.mark_read(connection, message_id).await
            }
        };

        match result {
            Ok(ack) => ack,
            Err(err) => {
                warn!(connection = %connection.id, event = name, error = %err, "Event rejected");
                Ack::failed(err.to_string())
            }
        }
    }

    /// Broadcast a newly registered user to every connection.
    pub fn announce_user(&self, identity: &Identity) -> usize {
        self.presence.announce(identity)
    }

    /// Broadcast a newly created channel to every connection.
    pub fn announce_channel(&self, channel: &Channel) -> usize {
        let event = Arc::new(OutboundEvent::NewChannel(channel.to_payload()));
        self.outbox.broadcast(&event)
    }

    async fn send_message(
        &self,
        connection: &Connection,
        send: SendMessage,
    ) -> Result<Ack, RouterError> {
        let target = MessageTarget::resolve(send.channel_id, send.recipient_id)?;
        let kind = send.kind.unwrap_or_default();
        let content = send.content.unwrap_or_default();

        if kind == MessageKind::Text && content.trim().is_empty() {
            return Err(RouterError::EmptyContent);
        }
        if content.chars().count() > self.config.max_content_length {
            return Err(RouterError::ContentTooLong(self.config.max_content_length));
        }

        let recipient = match &target {
            MessageTarget::Channel(channel_id) => {
                self.collaborators
                    .channels
                    .find_channel(channel_id)
                    .await?
                    .ok_or(RouterError::NotFound("Channel"))?;
                None
            }
            MessageTarget::Direct(recipient_id) => Some(
                self.collaborators
                    .users
                    .fetch_identity(recipient_id)
                    .await?
                    .ok_or(RouterError::NotFound("User"))?
                    .summary(),
            ),
        };

        let message = self
            .collaborators
            .messages
            .create(NewMessage {
                sender: connection.user_id().clone(),
                content,
                target,
                kind,
                file_url: send.file_url,
            })
            .await?;

        let payload = message.to_payload(connection.identity.summary(), recipient);
        let event = Arc::new(OutboundEvent::NewMessage(payload.clone()));

        let recipients = match &message.target {
            // Room fan-out includes the sender's own connection if it joined.
            MessageTarget::Channel(channel_id) => {
                self.outbox.send_to_all(&self.rooms.members(channel_id), &event)
            }
            MessageTarget::Direct(recipient_id) => {
                let targets = [
                    self.sessions.lookup_connection(recipient_id),
                    Some(connection.id.clone()),
                ];
                self.deliver_once(targets.into_iter().flatten(), &event)
            }
        };

        debug!(
            connection = %connection.id,
            message = %message.id,
            recipients,
            "Message sent"
        );
        Ok(Ack::ok().with_message(payload))
    }

    async fn join_channel(
        &self,
        connection: &Connection,
        channel_id: ChannelId,
    ) -> Result<Ack, RouterError> {
        let channel = self
            .collaborators
            .channels
            .find_channel(&channel_id)
            .await?
            .ok_or(RouterError::NotFound("Channel"))?;

        // The room limit is checked before membership is persisted.
        let entered = self.rooms.join(&channel_id, &connection.id)?;

        if !channel.has_member(connection.user_id()) {
            if let Err(e) = self
                .collaborators
                .channels
                .add_member(&channel_id, connection.user_id(), Utc::now())
                .await
            {
                if entered {
                    self.rooms.leave(&channel_id, &connection.id);
                }
                return Err(e.into());
            }
            debug!(channel = %channel_id, user = %connection.user_id(), "Added channel member");
        }

        let event = Arc::new(OutboundEvent::UserJoinedChannel(UserJoinedChannel {
            channel_id: channel_id.clone(),
            user_id: connection.user_id().clone(),
            username: connection.identity.username.clone(),
        }));
        self.outbox
            .send_to_all(&self.rooms.members(&channel_id), &event);

        Ok(Ack::ok())
    }

    fn leave_channel(&self, connection: &Connection, channel_id: &ChannelId) -> Ack {
        self.rooms.leave(channel_id, &connection.id);
        Ack::ok()
    }

    fn typing(&self, connection: &Connection, typing: Typing) -> Result<Ack, RouterError> {
        let target = MessageTarget::resolve(typing.channel_id, typing.recipient_id)?;

        let recipients = match target {
            // Unlike messages, typing notices never echo to the typist.
            MessageTarget::Channel(channel_id) => {
                let event = Arc::new(OutboundEvent::UserTyping(UserTyping {
                    user_id: connection.user_id().clone(),
                    username: connection.identity.username.clone(),
                    is_typing: typing.is_typing,
                    channel_id: Some(channel_id.clone()),
                }));
                let members = self.rooms.members(&channel_id);
                self.outbox.send_to_all(
                    members.iter().filter(|member| **member != connection.id),
                    &event,
                )
            }
            MessageTarget::Direct(recipient_id) => {
                match self.sessions.lookup_connection(&recipient_id) {
                    Some(target) => {
                        let event = Arc::new(OutboundEvent::UserTyping(UserTyping {
                            user_id: connection.user_id().clone(),
                            username: connection.identity.username.clone(),
                            is_typing: typing.is_typing,
                            channel_id: None,
                        }));
                        usize::from(self.outbox.send_to(&target, &event))
                    }
                    None => 0,
                }
            }
        };

        trace!(connection = %connection.id, recipients, "Typing relayed");
        Ok(Ack::ok())
    }

    async fn react(
        &self,
        connection: &Connection,
        request: ReactionRequest,
    ) -> Result<Ack, RouterError> {
        let outcome = self
            .mutations
            .toggle_reaction(&request.message_id, connection.user_id(), &request.emoji)
            .await?;

        let message = outcome.message;
        let event = Arc::new(OutboundEvent::MessageReactionUpdate(ReactionUpdate {
            message_id: message.id.clone(),
            reactions: message.reactions.clone(),
        }));

        let recipients = match &message.target {
            MessageTarget::Channel(channel_id) => {
                self.outbox.send_to_all(&self.rooms.members(channel_id), &event)
            }
            MessageTarget::Direct(recipient_id) => {
                let targets = [
                    self.sessions.lookup_connection(recipient_id),
                    self.sessions.lookup_connection(&message.sender),
                    Some(connection.id.clone()),
                ];
                self.deliver_once(targets.into_iter().flatten(), &event)
            }
        };

        debug!(
            connection = %connection.id,
            message = %message.id,
            added = outcome.added,
            recipients,
            "Reaction update sent"
        );
        Ok(Ack::ok().with_reactions(message.reactions))
    }

    async fn mark_read(
        &self,
        connection: &Connection,
        message_id: MessageId,
    ) -> Result<Ack, RouterError> {
        let outcome = self
            .mutations
            .mark_read(&message_id, connection.user_id())
            .await?;

        if outcome.applied {
            if let Some(target) = self.sessions.lookup_connection(&outcome.message.sender) {
                let event = Arc::new(OutboundEvent::MessageRead(MessageRead {
                    message_id: message_id.clone(),
                    read_by: connection.user_id().clone(),
                    read_at: outcome.read_at,
                }));
                self.outbox.send_to(&target, &event);
            }
        }

        Ok(Ack::ok().with_read_at(outcome.read_at))
    }

    /// Queue `event` once for each distinct connection in `targets`.
    fn deliver_once(
        &self,
        targets: impl IntoIterator<Item = ConnectionId>,
        event: &Arc<OutboundEvent>,
    ) -> usize {
        let mut seen = HashSet::new();
        targets
            .into_iter()
            .filter(|target| seen.insert(target.clone()))
            .filter(|target| self.outbox.send_to(target, event))
            .count()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of attached connections.
    pub connection_count: usize,
    /// Number of identities currently online.
    pub online_users: usize,
    /// Number of non-empty rooms.
    pub room_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StaticTokens;
    use crate::message::{Message, Versioned};
    use crate::outbox::{outbound_channel, OutboundReceiver};
    use crate::store::{MessageQuery, WriteOutcome};
    use async_trait::async_trait;
    use parley_protocol::{Reaction, ReadMarker, UserId};

    struct Hub {
        store: Arc<MemoryStore>,
        router: Router,
    }

    fn hub_with(config: RouterConfig) -> Hub {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(Identity::new("alice", "Alice"));
        store.insert_user(Identity::new("bob", "Bob"));
        store.insert_user(Identity::new("carol", "Carol"));
        store.insert_channel(Channel::new("general", "General", UserId::new("bob")));

        let tokens = StaticTokens::new()
            .with_token("alice-token", "alice")
            .with_token("bob-token", "bob")
            .with_token("carol-token", "carol")
            .with_token("ghost-token", "ghost");
        let collaborators = Collaborators::in_memory(Arc::clone(&store), Arc::new(tokens));

        Hub {
            router: Router::new(collaborators, config),
            store,
        }
    }

    fn hub() -> Hub {
        hub_with(RouterConfig::default())
    }

    impl Hub {
        async fn connect(&self, user: &str) -> (Connection, OutboundReceiver) {
            let (tx, rx) = outbound_channel();
            let token = format!("{user}-token");
            let connection = self.router.connect(Some(&token), tx).await.unwrap();
            (connection, rx)
        }

        async fn join(&self, connection: &Connection, channel: &str) {
            let ack = self
                .router
                .handle(
                    connection,
                    InboundEvent::JoinChannel(ChannelRef {
                        channel_id: ChannelId::new(channel),
                    }),
                )
                .await;
            assert!(ack.success, "join failed: {ack:?}");
        }

        async fn send(&self, connection: &Connection, send: SendMessage) -> Ack {
            self.router
                .handle(connection, InboundEvent::SendMessage(send))
                .await
        }
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<Arc<OutboundEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[Arc<OutboundEvent>]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_handshakes() {
        let hub = hub();

        for token in [None, Some(""), Some("forged"), Some("ghost-token")] {
            let (tx, _rx) = outbound_channel();
            let result = hub.router.connect(token, tx).await;
            assert!(
                matches!(result, Err(RouterError::Unauthenticated(_))),
                "token {token:?} was accepted"
            );
        }
        assert_eq!(hub.router.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_presence_is_broadcast_on_connect_and_disconnect() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, _bob_rx) = hub.connect("bob").await;

        hub.router.disconnect(&bob);

        let events = drain(&mut alice_rx);
        let changes: Vec<_> = events
            .iter()
            .filter_map(|e| match e.as_ref() {
                OutboundEvent::UserStatusChange(change) => Some(change.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].user_id, alice.identity.id);
        assert!(changes[0].is_online);
        assert_eq!(changes[1].username, "Bob");
        assert!(changes[1].is_online);
        assert!(!changes[2].is_online);
        assert!(changes[2].last_seen.is_some());
        assert!(!hub.router.sessions().is_online(bob.user_id()));
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_user_online() {
        let hub = hub();
        let (_alice, mut alice_rx) = hub.connect("alice").await;
        let (old_bob, _old_rx) = hub.connect("bob").await;
        let (new_bob, _new_rx) = hub.connect("bob").await;
        drain(&mut alice_rx);

        hub.router.disconnect(&old_bob);

        assert!(hub.router.sessions().is_online(new_bob.user_id()));
        assert_eq!(
            hub.router.sessions().lookup_connection(new_bob.user_id()),
            Some(new_bob.id.clone())
        );
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_send_requires_exactly_one_target() {
        let hub = hub();
        let (alice, _rx) = hub.connect("alice").await;

        let both = SendMessage {
            channel_id: Some(ChannelId::new("general")),
            ..SendMessage::to_user("bob", "hi")
        };
        let neither = SendMessage {
            content: Some("hi".into()),
            ..SendMessage::default()
        };

        for send in [both, neither] {
            let ack = hub.send(&alice, send).await;
            assert!(!ack.success);
            assert!(ack.error.is_some());
        }
        assert_eq!(hub.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_direct_message_to_offline_recipient() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        drain(&mut alice_rx);

        let ack = hub.send(&alice, SendMessage::to_user("bob", "are you there?")).await;
        assert!(ack.success);
        let payload = ack.message.unwrap();
        assert_eq!(payload.recipient.unwrap().username, "Bob");

        assert_eq!(hub.store.message_count(), 1);
        let events = drain(&mut alice_rx);
        assert_eq!(names(&events), vec!["newMessage"]);
    }

    #[tokio::test]
    async fn test_direct_message_reaches_recipient_and_echoes() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (_bob, mut bob_rx) = hub.connect("bob").await;
        let (_carol, mut carol_rx) = hub.connect("carol").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        hub.send(&alice, SendMessage::to_user("bob", "psst")).await;

        assert_eq!(names(&drain(&mut alice_rx)), vec!["newMessage"]);
        match drain(&mut bob_rx).first().map(|e| e.as_ref()) {
            Some(OutboundEvent::NewMessage(message)) => {
                assert_eq!(message.sender.username, "Alice");
                assert_eq!(message.content, "psst");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn test_self_direct_message_is_delivered_once() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        drain(&mut alice_rx);

        hub.send(&alice, SendMessage::to_user("alice", "note to self")).await;
        assert_eq!(names(&drain(&mut alice_rx)), vec!["newMessage"]);
    }

    #[tokio::test]
    async fn test_direct_message_to_unknown_user() {
        let hub = hub();
        let (alice, _rx) = hub.connect("alice").await;

        let ack = hub.send(&alice, SendMessage::to_user("nobody", "hi")).await;
        assert_eq!(ack.error.as_deref(), Some("User not found"));
        assert_eq!(hub.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_message_reaches_room_including_sender() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        let (_carol, mut carol_rx) = hub.connect("carol").await;
        hub.join(&alice, "general").await;
        hub.join(&bob, "general").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        let ack = hub.send(&bob, SendMessage::to_channel("general", "hi")).await;
        assert!(ack.success);

        for rx in [&mut alice_rx, &mut bob_rx] {
            match drain(rx).as_slice() {
                [event] => match event.as_ref() {
                    OutboundEvent::NewMessage(message) => {
                        assert_eq!(message.sender.id, UserId::new("bob"));
                        assert_eq!(message.sender.username, "Bob");
                        assert_eq!(message.channel_id, Some(ChannelId::new("general")));
                        assert!(message.recipient.is_none());
                    }
                    other => panic!("unexpected event {other:?}"),
                },
                other => panic!("unexpected events {other:?}"),
            }
        }
        assert!(drain(&mut carol_rx).is_empty());

        let stored = hub
            .store
            .list(&MessageQuery::Channel {
                channel_id: ChannelId::new("general"),
                since: None,
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].target.recipient_id(), None);
    }

    #[tokio::test]
    async fn test_channel_message_to_unknown_channel() {
        let hub = hub();
        let (alice, _rx) = hub.connect("alice").await;

        let ack = hub.send(&alice, SendMessage::to_channel("nowhere", "hi")).await;
        assert_eq!(ack.error.as_deref(), Some("Channel not found"));
        assert_eq!(hub.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_content_validation() {
        let hub = hub_with(RouterConfig {
            max_content_length: 5,
            ..RouterConfig::default()
        });
        let (alice, _rx) = hub.connect("alice").await;

        let ack = hub.send(&alice, SendMessage::to_channel("general", "   ")).await;
        assert!(!ack.success);
        let ack = hub.send(&alice, SendMessage::to_channel("general", "too long")).await;
        assert!(!ack.success);

        let file = SendMessage {
            kind: Some(MessageKind::File),
            file_url: Some("https://files.example/report.pdf".into()),
            ..SendMessage::to_channel("general", "")
        };
        let ack = hub.send(&alice, file).await;
        assert!(ack.success);
        assert_eq!(hub.store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_join_adds_member_and_notifies_room() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        hub.join(&bob, "general").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.join(&alice, "general").await;

        let channel = hub
            .store
            .find_channel(&ChannelId::new("general"))
            .await
            .unwrap()
            .unwrap();
        assert!(channel.has_member(alice.user_id()));

        for rx in [&mut alice_rx, &mut bob_rx] {
            match drain(rx).first().map(|e| e.as_ref()) {
                Some(OutboundEvent::UserJoinedChannel(joined)) => {
                    assert_eq!(joined.user_id, UserId::new("alice"));
                    assert_eq!(joined.username, "Alice");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_join_unknown_channel() {
        let hub = hub();
        let (alice, _rx) = hub.connect("alice").await;

        let ack = hub
            .router
            .handle(
                &alice,
                InboundEvent::JoinChannel(ChannelRef {
                    channel_id: ChannelId::new("nowhere"),
                }),
            )
            .await;
        assert_eq!(ack, Ack::failed("Channel not found"));
        assert!(hub.router.rooms().rooms_of(&alice.id).is_empty());
    }

    #[tokio::test]
    async fn test_room_limit_is_reported() {
        let hub = hub_with(RouterConfig {
            max_rooms_per_connection: 1,
            ..RouterConfig::default()
        });
        hub.store
            .insert_channel(Channel::new("random", "Random", UserId::new("bob")));
        let (alice, _rx) = hub.connect("alice").await;
        hub.join(&alice, "general").await;

        let ack = hub
            .router
            .handle(
                &alice,
                InboundEvent::JoinChannel(ChannelRef {
                    channel_id: ChannelId::new("random"),
                }),
            )
            .await;
        assert!(!ack.success);

        let random = hub
            .store
            .find_channel(&ChannelId::new("random"))
            .await
            .unwrap()
            .unwrap();
        assert!(!random.has_member(alice.user_id()));
        assert_eq!(hub.router.rooms().rooms_of(&alice.id), vec![ChannelId::new("general")]);
    }

    #[tokio::test]
    async fn test_leave_stops_room_delivery_but_keeps_membership() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, _bob_rx) = hub.connect("bob").await;
        hub.join(&alice, "general").await;

        let ack = hub
            .router
            .handle(
                &alice,
                InboundEvent::LeaveChannel(ChannelRef {
                    channel_id: ChannelId::new("general"),
                }),
            )
            .await;
        assert!(ack.success);
        drain(&mut alice_rx);

        hub.send(&bob, SendMessage::to_channel("general", "anyone?")).await;
        assert!(drain(&mut alice_rx).is_empty());

        let channel = hub
            .store
            .find_channel(&ChannelId::new("general"))
            .await
            .unwrap()
            .unwrap();
        assert!(channel.has_member(alice.user_id()));
    }

    #[tokio::test]
    async fn test_typing_excludes_sender_in_channel() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        hub.join(&alice, "general").await;
        hub.join(&bob, "general").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let ack = hub
            .router
            .handle(
                &alice,
                InboundEvent::Typing(Typing {
                    channel_id: Some(ChannelId::new("general")),
                    recipient_id: None,
                    is_typing: true,
                }),
            )
            .await;
        assert!(ack.success);

        assert!(drain(&mut alice_rx).is_empty());
        match drain(&mut bob_rx).first().map(|e| e.as_ref()) {
            Some(OutboundEvent::UserTyping(typing)) => {
                assert_eq!(typing.username, "Alice");
                assert!(typing.is_typing);
                assert_eq!(typing.channel_id, Some(ChannelId::new("general")));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(hub.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_direct_typing() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (_bob, mut bob_rx) = hub.connect("bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let typing = |recipient: &str| {
            InboundEvent::Typing(Typing {
                channel_id: None,
                recipient_id: Some(UserId::new(recipient)),
                is_typing: false,
            })
        };

        assert!(hub.router.handle(&alice, typing("bob")).await.success);
        // Offline recipient: silently dropped.
        assert!(hub.router.handle(&alice, typing("carol")).await.success);

        assert!(drain(&mut alice_rx).is_empty());
        match drain(&mut bob_rx).as_slice() {
            [event] => match event.as_ref() {
                OutboundEvent::UserTyping(typing) => assert!(typing.channel_id.is_none()),
                other => panic!("unexpected event {other:?}"),
            },
            other => panic!("unexpected events {other:?}"),
        }

        let invalid = InboundEvent::Typing(Typing::default());
        assert!(!hub.router.handle(&alice, invalid).await.success);

        let both = InboundEvent::Typing(Typing {
            channel_id: Some(ChannelId::new("general")),
            recipient_id: Some(UserId::new("bob")),
            is_typing: true,
        });
        let ack = hub.router.handle(&alice, both).await;
        assert!(!ack.success);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_reaction_toggle_broadcasts_both_states() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        hub.join(&alice, "general").await;
        hub.join(&bob, "general").await;
        let message_id = hub
            .send(&bob, SendMessage::to_channel("general", "vote"))
            .await
            .message
            .unwrap()
            .id;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let react = InboundEvent::MessageReaction(ReactionRequest {
            message_id: message_id.clone(),
            emoji: "🎉".into(),
        });
        let first = hub.router.handle(&alice, react.clone()).await;
        let second = hub.router.handle(&alice, react).await;

        assert_eq!(
            first.reactions,
            Some(vec![Reaction::new(UserId::new("alice"), "🎉")])
        );
        assert_eq!(second.reactions, Some(Vec::new()));

        let updates: Vec<_> = drain(&mut bob_rx)
            .iter()
            .filter_map(|e| match e.as_ref() {
                OutboundEvent::MessageReactionUpdate(update) => Some(update.reactions.len()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![1, 0]);
        assert_eq!(drain(&mut alice_rx).len(), 2);
    }

    #[tokio::test]
    async fn test_direct_reaction_reaches_both_parties_once() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        let message_id = hub
            .send(&alice, SendMessage::to_user("bob", "lunch?"))
            .await
            .message
            .unwrap()
            .id;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.router
            .handle(
                &bob,
                InboundEvent::MessageReaction(ReactionRequest {
                    message_id,
                    emoji: "👍".into(),
                }),
            )
            .await;

        assert_eq!(names(&drain(&mut alice_rx)), vec!["messageReactionUpdate"]);
        assert_eq!(names(&drain(&mut bob_rx)), vec!["messageReactionUpdate"]);
    }

    #[tokio::test]
    async fn test_reaction_on_missing_message() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        drain(&mut alice_rx);

        let ack = hub
            .router
            .handle(
                &alice,
                InboundEvent::MessageReaction(ReactionRequest {
                    message_id: MessageId::new("missing"),
                    emoji: "👍".into(),
                }),
            )
            .await;
        assert_eq!(ack, Ack::failed("Message not found"));
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_notifies_sender_once() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        let message_id = hub
            .send(&alice, SendMessage::to_user("bob", "read me"))
            .await
            .message
            .unwrap()
            .id;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let read = InboundEvent::MarkAsRead(MessageRef {
            message_id: message_id.clone(),
        });
        let first = hub.router.handle(&bob, read.clone()).await;
        let second = hub.router.handle(&bob, read).await;
        assert!(first.success && second.success);
        assert_eq!(first.read_at, second.read_at);

        match drain(&mut alice_rx).as_slice() {
            [event] => match event.as_ref() {
                OutboundEvent::MessageRead(read) => {
                    assert_eq!(read.message_id, message_id);
                    assert_eq!(read.read_by, UserId::new("bob"));
                }
                other => panic!("unexpected event {other:?}"),
            },
            other => panic!("unexpected events {other:?}"),
        }
        assert!(drain(&mut bob_rx).is_empty());

        let stored = hub.store.find_by_id(&message_id).await.unwrap().unwrap();
        assert_eq!(stored.value.read_by.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_read_receipt_reaches_only_sender() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        let (carol, mut carol_rx) = hub.connect("carol").await;
        for connection in [&alice, &bob, &carol] {
            hub.join(connection, "general").await;
        }
        let message_id = hub
            .send(&alice, SendMessage::to_channel(ChannelId::new("general"), "hi all"))
            .await
            .message
            .unwrap()
            .id;
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        let ack = hub
            .router
            .handle(
                &bob,
                InboundEvent::MarkAsRead(MessageRef {
                    message_id: message_id.clone(),
                }),
            )
            .await;
        assert!(ack.success);

        assert_eq!(names(&drain(&mut alice_rx)), vec!["messageRead"]);
        assert!(drain(&mut bob_rx).is_empty());
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_reconnect_and_stale_disconnect_end_online() {
        let hub = Arc::new(hub());
        let (_alice, mut alice_rx) = hub.connect("alice").await;

        for _ in 0..300 {
            let (old_bob, _old_rx) = hub.connect("bob").await;
            drain(&mut alice_rx);

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let disconnect = {
                let hub = Arc::clone(&hub);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    hub.router.disconnect(&old_bob);
                })
            };
            let reconnect = {
                let hub = Arc::clone(&hub);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    hub.connect("bob").await
                })
            };
            disconnect.await.unwrap();
            let (new_bob, _new_rx) = reconnect.await.unwrap();

            let last = drain(&mut alice_rx)
                .iter()
                .filter_map(|e| match e.as_ref() {
                    OutboundEvent::UserStatusChange(change) => Some(change.is_online),
                    _ => None,
                })
                .last();
            assert_eq!(last, Some(true));
            assert!(hub.router.sessions().is_online(new_bob.user_id()));

            hub.router.disconnect(&new_bob);
        }
    }

    #[tokio::test]
    async fn test_announcements_reach_everyone() {
        let hub = hub();
        let (_alice, mut alice_rx) = hub.connect("alice").await;
        let (_bob, mut bob_rx) = hub.connect("bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert_eq!(hub.router.announce_user(&Identity::new("dave", "Dave")), 2);
        let channel = Channel::new("dev", "Dev", UserId::new("alice"));
        assert_eq!(hub.router.announce_channel(&channel), 2);

        assert_eq!(names(&drain(&mut alice_rx)), vec!["newUser", "newChannel"]);
        assert_eq!(names(&drain(&mut bob_rx)), vec!["newUser", "newChannel"]);
    }

    #[tokio::test]
    async fn test_disconnect_clears_rooms() {
        let hub = hub();
        let (alice, _rx) = hub.connect("alice").await;
        hub.join(&alice, "general").await;
        assert_eq!(hub.router.stats().room_count, 1);

        hub.router.disconnect(&alice);
        assert_eq!(
            hub.router.stats(),
            RouterStats {
                connection_count: 0,
                online_users: 0,
                room_count: 0,
            }
        );
    }

    /// Message store that is always down.
    struct UnavailableMessages;

    #[async_trait]
    impl MessageStore for UnavailableMessages {
        async fn create(&self, _draft: NewMessage) -> Result<Message, StoreError> {
            Err(StoreError::Unavailable("primary down".into()))
        }

        async fn find_by_id(
            &self,
            _id: &MessageId,
        ) -> Result<Option<Versioned<Message>>, StoreError> {
            Err(StoreError::Unavailable("primary down".into()))
        }

        async fn update_reactions(
            &self,
            _id: &MessageId,
            _expected_version: u64,
            _reactions: Vec<Reaction>,
        ) -> Result<WriteOutcome, StoreError> {
            Err(StoreError::Unavailable("primary down".into()))
        }

        async fn update_read_by(
            &self,
            _id: &MessageId,
            _expected_version: u64,
            _read_by: Vec<ReadMarker>,
        ) -> Result<WriteOutcome, StoreError> {
            Err(StoreError::Unavailable("primary down".into()))
        }

        async fn list(&self, _query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Unavailable("primary down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_only_to_caller() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(Identity::new("alice", "Alice"));
        store.insert_user(Identity::new("bob", "Bob"));
        store.insert_channel(Channel::new("general", "General", UserId::new("bob")));
        let tokens = StaticTokens::new()
            .with_token("alice-token", "alice")
            .with_token("bob-token", "bob");
        let collaborators = Collaborators {
            messages: Arc::new(UnavailableMessages),
            ..Collaborators::in_memory(store, Arc::new(tokens))
        };
        let hub = Hub {
            router: Router::new(collaborators, RouterConfig::default()),
            store: Arc::new(MemoryStore::new()),
        };

        let (alice, mut alice_rx) = hub.connect("alice").await;
        let (bob, mut bob_rx) = hub.connect("bob").await;
        hub.join(&alice, "general").await;
        hub.join(&bob, "general").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let ack = hub.send(&alice, SendMessage::to_channel("general", "hello")).await;
        assert!(!ack.success);
        assert!(ack.error.unwrap().contains("primary down"));

        let ack = hub
            .router
            .handle(
                &alice,
                InboundEvent::MarkAsRead(MessageRef {
                    message_id: MessageId::new("m"),
                }),
            )
            .await;
        assert!(!ack.success);

        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());
        assert!(hub.router.sessions().is_online(alice.user_id()));
    }
}
