//! # courier-core
//!
//! The distributed delivery layer of Courier: who is online, which channels
//! each connection belongs to, and how an event reaches the right
//! connections no matter which worker holds them.
//!
//! - **Identity** - Resolve raw user ids in either encoding to one canonical id
//! - **Presence** - Shared connection ↔ user directory with leases
//! - **Handshake** - Authenticate, register presence, own connection cleanup
//! - **Membership** - Mirror persisted channel lists into local groups
//! - **Fan-out** - Group, connection and user delivery across workers
//! - **Router** - Validate, persist, then fan out client events
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌────────────┐    ┌─────────────┐    ┌──────────┐
//! │ Handshake  │───▶│  Router    │───▶│ Broadcaster │───▶│ EventBus │
//! └────────────┘    └────────────┘    └─────────────┘    └──────────┘
//!       │                 │                  │                 │
//!       ▼                 ▼                  ▼                 ▼
//! ┌────────────┐    ┌────────────┐    ┌─────────────┐    ┌──────────┐
//! │  Presence  │    │ ChatStore  │    │  Presence   │    │ LocalHub │
//! └────────────┘    └────────────┘    └─────────────┘    └──────────┘
//! ```

pub mod bus;
pub mod error;
pub mod fanout;
pub mod group;
pub mod handshake;
pub mod hub;
pub mod identity;
pub mod memory;
pub mod membership;
pub mod message;
pub mod node;
pub mod presence;
pub mod router;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_bus;
#[cfg(feature = "redis")]
pub mod redis_presence;

pub use bus::{Envelope, EventBus, LocalBus};
pub use error::{RelayError, StoreError};
pub use fanout::{Broadcaster, Delivery};
pub use group::GroupId;
pub use handshake::{Handshake, HandshakeConfig, HandshakeRequest, HandshakeState, JoinedConnection};
pub use hub::{
    HubConfig, HubError, HubStats, LocalHub, Outbound, OutboundReceiver, OutboundSender,
};
pub use identity::{Identity, IdentityResolver, Role, UserDirectory, UserId};
pub use memory::MemoryStore;
pub use membership::MembershipSync;
pub use node::{Collaborators, Node, NodeConfig};
pub use presence::{MemoryPresence, PresenceDirectory};
pub use router::{Directive, EventRouter, EventStage, Origin, RouteOutcome};
pub use store::{AuthVerifier, ChatStore, Claims, RejectAllTokens};

#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;
#[cfg(feature = "redis")]
pub use redis_presence::RedisPresence;
