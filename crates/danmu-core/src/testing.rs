//! Test doubles shared by the unit tests.

use crate::collab::{
    CollaboratorError, Collaborators, CredentialVerifier, MessageStore, Principal,
    VerifiedCredential,
};
use crate::memory::{MemorySessionCache, MemoryStore};
use crate::message::{MessageId, NewDanmu};
use crate::room::RoomId;
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Accepts exactly one token, for principal 7 with role `user`.
#[derive(Debug, Default)]
pub(crate) struct StaticVerifier {
    pub calls: AtomicUsize,
}

impl StaticVerifier {
    pub const VALID: &'static str = "valid-token";
}

#[async_trait]
impl CredentialVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if token == Self::VALID {
            Ok(VerifiedCredential {
                principal_id: 7,
                role: "user".into(),
            })
        } else {
            Err(CollaboratorError::Rejected("invalid signature".into()))
        }
    }
}

/// A [`MemoryStore`] whose writes can be made to fail.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_inserts: AtomicBool,
    fail_counters: AtomicBool,
}

impl FlakyStore {
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_counters(&self, fail: bool) {
        self.fail_counters.store(fail, Ordering::SeqCst);
    }
}

impl Deref for FlakyStore {
    type Target = MemoryStore;

    fn deref(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn insert_message(&self, message: &NewDanmu) -> Result<MessageId, CollaboratorError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("database down".into()));
        }
        self.inner.insert_message(message).await
    }

    async fn increment_room_counter(&self, room_id: &RoomId) -> Result<(), CollaboratorError> {
        if self.fail_counters.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("database down".into()));
        }
        self.inner.increment_room_counter(room_id).await
    }

    async fn index_message(&self, room_id: &RoomId, id: MessageId) -> Result<(), CollaboratorError> {
        self.inner.index_message(room_id, id).await
    }

    async fn invalidate_cached_aggregate(&self, room_id: &RoomId) -> Result<(), CollaboratorError> {
        self.inner.invalidate_cached_aggregate(room_id).await
    }
}

/// Collaborators with principal 7 signed in.
pub(crate) struct Fixture {
    pub verifier: Arc<StaticVerifier>,
    pub sessions: Arc<MemorySessionCache>,
    pub store: Arc<FlakyStore>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            verifier: Arc::new(StaticVerifier::default()),
            sessions: Arc::new(MemorySessionCache::with_principals([Principal {
                id: 7,
                role: "user".into(),
                nickname: Some("alice".into()),
            }])),
            store: Arc::new(FlakyStore::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            verifier: self.verifier.clone(),
            identity: self.sessions.clone(),
            store: self.store.clone(),
        }
    }
}
