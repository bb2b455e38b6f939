//! # parley-core
//!
//! The live engine of the Parley chat backend.
//!
//! This crate provides:
//!
//! - **Session Store** - which connection speaks for each identity
//! - **Room Registry** - per-channel live subscriptions
//! - **Presence Tracker** - online/offline broadcasts
//! - **Router** - single entry point for inbound events and fan-out
//! - **Mutation Coordinator** - lost-update free reactions and read markers
//! - **History** - paged history, search and per-conversation aggregates
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Transport  │────▶│   Router    │────▶│ RoomRegistry │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!        ▲                   │   │
//!        │                   │   └──────────▶ SessionStore ──▶ PresenceTracker
//!        │                   ▼
//!   ┌─────────┐      ┌──────────────────┐     ┌──────────────┐
//!   │ Outbox  │◀─────│ MutationCoord.   │────▶│ MessageStore │
//!   └─────────┘      └──────────────────┘     └──────────────┘
//! ```
//!
//! Persistence and token verification are reached through the traits in
//! [`store`]; [`memory`] bundles in-process implementations.

pub mod channel;
pub mod history;
pub mod memory;
pub mod message;
pub mod mutation;
pub mod outbox;
pub mod presence;
pub mod rooms;
pub mod router;
pub mod session;
pub mod store;

pub use channel::{Channel, ChannelMember};
pub use history::{Conversation, History, LastMessageTimes, Page, UnreadCounts};
pub use memory::{MemoryStore, StaticTokens};
pub use message::{InvalidAddressing, Message, MessageTarget, NewMessage, Versioned};
pub use mutation::{MutationCoordinator, MutationError, ReactionOutcome, ReadOutcome};
pub use outbox::{outbound_channel, OutboundReceiver, OutboundSender, Outbox};
pub use presence::PresenceTracker;
pub use rooms::{RoomError, RoomRegistry};
pub use router::{Collaborators, Router, RouterConfig, RouterError, RouterStats};
pub use session::{Connection, PresenceRecord, PresenceTransition, SessionStore};
pub use store::{
    AuthError, ChannelStore, Identity, MessageQuery, MessageStore, StoreError, TokenVerifier,
    UserDirectory, VerifiedToken, WriteOutcome,
};
