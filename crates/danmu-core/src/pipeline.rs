//! Danmu acceptance pipeline.
//!
//! Each inbound frame goes through parse, authenticate, resolve, validate,
//! persist and broadcast, stopping at the first failure. Rejections are
//! answered on the sender's connection only; nothing reaches the room
//! unless every step before the broadcast succeeded.

use crate::broadcaster::{Broadcaster, DeliveryReport};
use crate::collab::{CollaboratorError, Collaborators, Principal};
use crate::message::{
    generate_message_id, ContentLimits, DomainMessage, InboundMessage, NewDanmu, ValidationError,
};
use crate::room::{ConnectionId, RoomId};
use danmu_protocol::{codec, codes, ClientFrame, Envelope, ProtocolError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// What to do when a danmu cannot be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistencePolicy {
    /// Drop the danmu and tell the sender. Nothing is broadcast that a
    /// reload could not show again.
    #[default]
    RequireStored,
    /// Broadcast anyway under a locally generated id.
    BestEffort,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Behaviour when the store refuses a danmu.
    pub policy: PersistencePolicy,
    /// Field limits applied during validation.
    pub limits: ContentLimits,
}

/// Why a credential was not accepted.
#[derive(Debug, Error)]
pub enum AuthFailure {
    /// Absent, not `Bearer `-prefixed, or blank.
    #[error("Missing or malformed bearer credential")]
    MissingCredential,

    /// The verifier refused the token.
    #[error("Credential rejected: {0}")]
    Verification(CollaboratorError),

    /// The token is valid but no session exists for it.
    #[error("No session for principal {0}")]
    UnknownPrincipal(u64),

    /// The session lookup itself failed.
    #[error("Session lookup failed: {0}")]
    Lookup(CollaboratorError),
}

/// Reasons a danmu was not accepted.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Authentication failed: {0}")]
    Unauthenticated(#[from] AuthFailure),

    #[error("Invalid danmu: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Danmu not stored: {0}")]
    NotStored(CollaboratorError),
}

impl Rejection {
    /// Short label, used for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::Malformed(_) => "malformed",
            Rejection::Unauthenticated(_) => "unauthenticated",
            Rejection::Invalid(_) => "invalid",
            Rejection::NotStored(_) => "not_stored",
        }
    }

    /// The reply sent to the offending connection.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Rejection::Malformed(_) => Envelope::error(codes::MALFORMED, "malformed message"),
            Rejection::Unauthenticated(_) => Envelope::error(codes::UNAUTHENTICATED, "login expired"),
            Rejection::Invalid(e) => Envelope::error(codes::INVALID, e.to_string()),
            Rejection::NotStored(_) => {
                Envelope::error(codes::STORAGE_UNAVAILABLE, "danmu could not be saved")
            }
        }
    }
}

/// An accepted danmu and how its broadcast went.
#[derive(Debug, Clone)]
pub struct Accepted {
    /// The stored danmu as broadcast.
    pub message: DomainMessage,
    /// Fan-out outcome across the room.
    pub delivery: DeliveryReport,
}

/// Runs inbound frames through acceptance and broadcasts the result.
pub struct MessagePipeline {
    collaborators: Collaborators,
    broadcaster: Broadcaster,
    config: PipelineConfig,
}

impl MessagePipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(collaborators: Collaborators, broadcaster: Broadcaster, config: PipelineConfig) -> Self {
        Self {
            collaborators,
            broadcaster,
            config,
        }
    }

    /// Process one raw frame from `connection_id`, attached to `room_id`.
    ///
    /// On rejection the sender has already been sent an error envelope.
    ///
    /// # Errors
    ///
    /// Returns the step that stopped the danmu.
    pub async fn process(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        raw: &str,
    ) -> Result<Accepted, Rejection> {
        self.run(room_id, connection_id, codec::decode_client(raw))
            .await
    }

    /// Process a frame that arrived as bytes. Anything that is not UTF-8
    /// is rejected as malformed.
    ///
    /// # Errors
    ///
    /// Returns the step that stopped the danmu.
    pub async fn process_bytes(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        raw: &[u8],
    ) -> Result<Accepted, Rejection> {
        self.run(room_id, connection_id, codec::decode_client_bytes(raw))
            .await
    }

    async fn run(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        frame: Result<ClientFrame, ProtocolError>,
    ) -> Result<Accepted, Rejection> {
        let result = self.accept(room_id, frame).await;

        match &result {
            Ok(accepted) => debug!(
                room = %room_id,
                connection = %connection_id,
                id = accepted.message.id(),
                recipients = accepted.delivery.attempted,
                "Danmu accepted"
            ),
            Err(rejection) => self.reject(room_id, connection_id, rejection),
        }

        result
    }

    async fn accept(
        &self,
        room_id: &RoomId,
        frame: Result<ClientFrame, ProtocolError>,
    ) -> Result<Accepted, Rejection> {
        let inbound = InboundMessage::from_frame(room_id.clone(), frame?);

        let principal = self.authenticate(&inbound).await?;
        let danmu = inbound.validate(&principal, &self.config.limits)?;
        let message = self.persist(danmu).await?;

        let delivery = match codec::encode(&Envelope::message(message.to_record())) {
            Ok(text) => self.broadcaster.broadcast(room_id, Arc::from(text)),
            Err(e) => {
                error!(room = %room_id, id = message.id(), error = %e, "Failed to encode danmu");
                DeliveryReport::default()
            }
        };

        Ok(Accepted { message, delivery })
    }

    async fn authenticate(&self, inbound: &InboundMessage) -> Result<Principal, AuthFailure> {
        let token = inbound.bearer_token().ok_or(AuthFailure::MissingCredential)?;

        let credential = self
            .collaborators
            .verifier
            .verify(token)
            .await
            .map_err(AuthFailure::Verification)?;

        match self
            .collaborators
            .identity
            .lookup(&credential.role, credential.principal_id)
            .await
        {
            Ok(Some(principal)) => Ok(principal),
            Ok(None) => Err(AuthFailure::UnknownPrincipal(credential.principal_id)),
            Err(e) => Err(AuthFailure::Lookup(e)),
        }
    }

    async fn persist(&self, danmu: NewDanmu) -> Result<DomainMessage, Rejection> {
        let store = &self.collaborators.store;
        let room_id = danmu.room_id.clone();

        let id = match store.insert_message(&danmu).await {
            Ok(id) => id,
            Err(e) => match self.config.policy {
                PersistencePolicy::RequireStored => {
                    error!(room = %room_id, error = %e, "Failed to store danmu, not broadcasting");
                    return Err(Rejection::NotStored(e));
                }
                PersistencePolicy::BestEffort => {
                    error!(room = %room_id, error = %e, "Failed to store danmu, broadcasting unsaved");
                    return Ok(danmu.into_message(generate_message_id()));
                }
            },
        };

        // The danmu is stored; the remaining bookkeeping never blocks the broadcast.
        if let Err(e) = store.increment_room_counter(&room_id).await {
            error!(room = %room_id, id, error = %e, "Failed to increment room counter");
        }
        if let Err(e) = store.index_message(&room_id, id).await {
            error!(room = %room_id, id, error = %e, "Failed to index danmu");
        }
        if let Err(e) = store.invalidate_cached_aggregate(&room_id).await {
            warn!(room = %room_id, error = %e, "Failed to invalidate cached room stats");
        }

        Ok(danmu.into_message(id))
    }

    fn reject(&self, room_id: &RoomId, connection_id: &ConnectionId, rejection: &Rejection) {
        warn!(
            room = %room_id,
            connection = %connection_id,
            kind = rejection.kind(),
            error = %rejection,
            "Danmu rejected"
        );

        match codec::encode(&rejection.to_envelope()) {
            Ok(text) => {
                let outcome = self.broadcaster.send_to(connection_id, Arc::from(text));
                if !outcome.is_delivered() {
                    debug!(connection = %connection_id, ?outcome, "Rejection not delivered");
                }
            }
            Err(e) => error!(connection = %connection_id, error = %e, "Failed to encode rejection"),
        }
    }
}
