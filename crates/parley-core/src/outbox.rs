//! Per-connection delivery queues.
//!
//! Each live connection registers the sending half of an unbounded channel.
//! Fan-out is a non-blocking push onto those queues; the transport task that
//! owns the receiving half writes events to its socket in order.

use std::sync::Arc;

use dashmap::DashMap;
use parley_protocol::{ConnectionId, OutboundEvent};
use tokio::sync::mpsc;
use tracing::trace;

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<Arc<OutboundEvent>>;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Arc<OutboundEvent>>;

/// Create a new outbound queue for one connection.
#[must_use]
pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// Registry of outbound queues keyed by connection.
#[derive(Debug, Default)]
pub struct Outbox {
    senders: DashMap<ConnectionId, OutboundSender>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, connection_id: ConnectionId, sender: OutboundSender) {
        self.senders.insert(connection_id, sender);
    }

    pub fn detach(&self, connection_id: &ConnectionId) {
        self.senders.remove(connection_id);
    }

    /// Number of attached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Queue an event for one connection.
    ///
    /// Returns `false` if the connection is unknown or its queue is closed.
    pub fn send_to(&self, connection_id: &ConnectionId, event: &Arc<OutboundEvent>) -> bool {
        match self.senders.get(connection_id) {
            Some(sender) => sender.send(Arc::clone(event)).is_ok(),
            None => {
                trace!(connection = %connection_id, event = event.name(), "No outbound queue");
                false
            }
        }
    }

    /// Queue an event for every listed connection.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn send_to_all<'a>(
        &self,
        connections: impl IntoIterator<Item = &'a ConnectionId>,
        event: &Arc<OutboundEvent>,
    ) -> usize {
        connections
            .into_iter()
            .filter(|id| self.send_to(id, event))
            .count()
    }

    /// Queue an event for every attached connection.
    pub fn broadcast(&self, event: &Arc<OutboundEvent>) -> usize {
        self.senders
            .iter()
            .filter(|entry| entry.value().send(Arc::clone(event)).is_ok())
            .count()
    }
}
