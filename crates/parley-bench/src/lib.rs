//! Shared fixtures for the Parley benchmarks.

use std::sync::Arc;

use parley_core::{
    outbound_channel, Channel, Collaborators, Connection, Identity, MemoryStore, OutboundReceiver,
    Router, RouterConfig, StaticTokens,
};
use parley_protocol::{ChannelId, ChannelRef, InboundEvent, UserId};

/// A router with `n` connected users, all joined to one channel.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub router: Router,
    pub channel: ChannelId,
    pub connections: Vec<Connection>,
    receivers: Vec<OutboundReceiver>,
}

impl Fixture {
    /// Build a fixture with `users` connections in channel `bench`.
    ///
    /// # Panics
    ///
    /// Panics if the fixture cannot be set up.
    pub async fn new(users: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let channel = ChannelId::new("bench");
        store.insert_channel(Channel::new(channel.clone(), "Bench", UserId::new("user-0")));

        let mut tokens = StaticTokens::new();
        for i in 0..users {
            let id = format!("user-{i}");
            store.insert_user(Identity::new(id.as_str(), id.as_str()));
            tokens = tokens.with_token(format!("token-{i}"), id.as_str());
        }

        let router = Router::new(
            Collaborators::in_memory(Arc::clone(&store), Arc::new(tokens)),
            RouterConfig::default(),
        );

        let mut connections = Vec::with_capacity(users);
        let mut receivers = Vec::with_capacity(users);
        for i in 0..users {
            let (tx, rx) = outbound_channel();
            let token = format!("token-{i}");
            let connection = router
                .connect(Some(&token), tx)
                .await
                .expect("fixture user connects");
            let ack = router
                .handle(
                    &connection,
                    InboundEvent::JoinChannel(ChannelRef {
                        channel_id: channel.clone(),
                    }),
                )
                .await;
            assert!(ack.success, "fixture join failed: {ack:?}");
            connections.push(connection);
            receivers.push(rx);
        }

        let mut fixture = Self {
            store,
            router,
            channel,
            connections,
            receivers,
        };
        fixture.drain();
        fixture
    }

    /// Discard queued outbound events. Returns how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for rx in &mut self.receivers {
            while rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        drained
    }
}
