//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat engine.
//!
//! This crate defines everything a client and the server exchange:
//!
//! - **Types** - typed identifiers, reactions, read markers
//! - **Events** - inbound client events, outbound broadcasts, acknowledgements
//! - **Frames** - request/ack/event envelopes plus handshake and keepalive
//! - **Codec** - JSON text frames and length-prefixed MessagePack frames
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientFrame, InboundEvent, SendMessage};
//!
//! let frame = ClientFrame::request(1, InboundEvent::SendMessage(SendMessage::to_channel("general", "hi")));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod frames;
pub mod types;

pub use codec::{ProtocolError, WireFormat};
pub use events::{
    Ack, ChannelPayload, ChannelRef, InboundEvent, MessagePayload, MessageRead, MessageRef,
    OutboundEvent, ReactionRequest, ReactionUpdate, SendMessage, Typing, UserJoinedChannel,
    UserPayload, UserStatusChange, UserTyping,
};
pub use frames::{ClientFrame, EventFrame, ServerFrame, PROTOCOL_VERSION};
pub use types::{
    ChannelId, ConnectionId, MessageId, MessageKind, Reaction, ReadMarker, UserId, UserSummary,
};
