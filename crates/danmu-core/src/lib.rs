//! # danmu-core
//!
//! Room membership, fan-out and danmu acceptance for the danmu relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConnectionRegistry** - the only owner of outbound send capability
//! - **RoomDirectory** - room membership with copy-on-write snapshots
//! - **Broadcaster** - per-member isolated fan-out
//! - **MessagePipeline** - authenticate, validate, persist, broadcast
//! - **Relay** - entry point for attach / payload / detach events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │  Transport  │────▶│    Relay    │────▶│ MessagePipeline  │
//! └─────────────┘     └─────────────┘     └──────────────────┘
//!                       │         │                 │
//!                       ▼         ▼                 ▼
//!              ┌───────────────┐ ┌─────────────┐ ┌─────────────────┐
//!              │ RoomDirectory │ │ Broadcaster │ │  Collaborators  │
//!              └───────────────┘ └─────────────┘ └─────────────────┘
//!                                       │
//!                                       ▼
//!                            ┌────────────────────┐
//!                            │ ConnectionRegistry │
//!                            └────────────────────┘
//! ```

pub mod broadcaster;
pub mod collab;
pub mod directory;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod room;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcaster::{Broadcaster, DeliveryReport};
pub use collab::{
    CollaboratorError, Collaborators, CredentialVerifier, IdentityLookup, MessageStore, Principal,
    VerifiedCredential,
};
pub use directory::{MemberSnapshot, RoomDirectory};
pub use memory::{MemorySessionCache, MemoryStore};
pub use message::{ContentLimits, DomainMessage, InboundMessage, MessageId, NewDanmu};
pub use pipeline::{Accepted, AuthFailure, MessagePipeline, PersistencePolicy, PipelineConfig, Rejection};
pub use registry::{ConnectionRegistry, Outbound, OutboundReceiver, SendOutcome};
pub use relay::{Attached, Detached, Relay, RelayConfig, RelayError, RelayStats};
pub use room::{ConnectionId, RoomId};
