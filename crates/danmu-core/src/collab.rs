//! Interfaces to the services the relay depends on.
//!
//! Credential verification, identity lookup and storage live outside the
//! core. Their failures come back as [`CollaboratorError`] values and are
//! never fatal to a connection or room.

use crate::message::{MessageId, NewDanmu};
use crate::room::RoomId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The input was understood and refused (e.g. an expired token).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The backing service could not be reached or failed.
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

/// Identity carried by a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    /// The principal the token was issued to.
    pub principal_id: u64,
    /// Role claim, used to locate the principal's session.
    pub role: String,
}

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Numeric user id, the `sub` of its tokens.
    pub id: u64,
    /// Session namespace, e.g. `user`.
    pub role: String,
    /// Display name, if known.
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Turns a bearer token (without its `Bearer ` prefix) into an identity.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify a token.
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, CollaboratorError>;
}

/// Resolves a verified identity to a live session.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Look up a principal; `Ok(None)` when no session exists.
    async fn lookup(&self, role: &str, principal_id: u64) -> Result<Option<Principal>, CollaboratorError>;
}

/// Durable storage for accepted danmu.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a danmu and return its generated id.
    async fn insert_message(&self, message: &NewDanmu) -> Result<MessageId, CollaboratorError>;

    /// Bump the room's danmu counter.
    async fn increment_room_counter(&self, room_id: &RoomId) -> Result<(), CollaboratorError>;

    /// Add a stored id to the room's id set, read by history queries.
    async fn index_message(&self, room_id: &RoomId, id: MessageId) -> Result<(), CollaboratorError>;

    /// Drop any cached aggregate view of the room.
    async fn invalidate_cached_aggregate(&self, room_id: &RoomId) -> Result<(), CollaboratorError>;
}

/// The collaborator set a relay is built with.
#[derive(Clone)]
pub struct Collaborators {
    /// Checks bearer tokens.
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Resolves verified identities to sessions.
    pub identity: Arc<dyn IdentityLookup>,
    /// Stores accepted danmu.
    pub store: Arc<dyn MessageStore>,
}
