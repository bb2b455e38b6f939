//! Frame types for the Parley protocol.
//!
//! Frames wrap events with the bookkeeping a socket needs: request ids for
//! acknowledgements, the handshake reply and keepalives.

use serde::{Deserialize, Serialize};

use crate::events::{Ack, InboundEvent, OutboundEvent};
use crate::types::{ConnectionId, UserId};

/// Current protocol version, reported in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error code sent when an inbound frame cannot be decoded.
pub const ERROR_MALFORMED_FRAME: u16 = 1001;

/// A frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// An inbound event expecting an acknowledgement with the same id.
    Request {
        id: u64,
        event: InboundEvent,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Create a new Request frame.
    #[must_use]
    pub fn request(id: u64, event: InboundEvent) -> Self {
        ClientFrame::Request { id, event }
    }
}

/// A frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Reply to a `request` frame.
    Ack { id: u64, ack: Ack },

    /// A pushed event.
    Event { event: OutboundEvent },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// The previous frame could not be understood.
    Error { code: u16, message: String },
}

impl ServerFrame {
    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: ConnectionId, user_id: UserId, heartbeat: u32) -> Self {
        ServerFrame::Connected {
            connection_id,
            user_id,
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64, ack: Ack) -> Self {
        ServerFrame::Ack { id, ack }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }
}

/// Borrowed form of [`ServerFrame::Event`].
///
/// Serializes identically, so a shared event can be encoded once per
/// connection without cloning it into an owned frame.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "type", rename = "event")]
pub struct EventFrame<'a> {
    pub event: &'a OutboundEvent,
}
