//! In-process collaborator implementations.
//!
//! [`MemorySessionCache`] mirrors the shape of a `security:<role>:<id>`
//! session cache and [`MemoryStore`] keeps messages, per-room counters and
//! per-room id sets. Both are safe to share across connection tasks.

use crate::collab::{CollaboratorError, IdentityLookup, MessageStore, Principal};
use crate::message::{DomainMessage, MessageId, NewDanmu};
use crate::room::RoomId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Signed-in principals keyed by role and id.
#[derive(Debug, Default)]
pub struct MemorySessionCache {
    sessions: DashMap<(String, u64), Principal>,
}

impl MemorySessionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache holding the given principals.
    #[must_use]
    pub fn with_principals(principals: impl IntoIterator<Item = Principal>) -> Self {
        let cache = Self::new();
        for principal in principals {
            cache.insert(principal);
        }
        cache
    }

    /// Add or replace a session.
    pub fn insert(&self, principal: Principal) {
        debug!(principal = principal.id, role = %principal.role, "Session cached");
        self.sessions
            .insert((principal.role.clone(), principal.id), principal);
    }

    /// Drop a session. Returns the removed principal, if any.
    pub fn remove(&self, role: &str, principal_id: u64) -> Option<Principal> {
        self.sessions
            .remove(&(role.to_string(), principal_id))
            .map(|(_, principal)| principal)
    }

    /// Number of cached sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl IdentityLookup for MemorySessionCache {
    async fn lookup(&self, role: &str, principal_id: u64) -> Result<Option<Principal>, CollaboratorError> {
        Ok(self
            .sessions
            .get(&(role.to_string(), principal_id))
            .map(|p| p.value().clone()))
    }
}

/// Message storage held in memory.
#[derive(Debug)]
pub struct MemoryStore {
    next_id: AtomicU64,
    messages: DashMap<MessageId, DomainMessage>,
    counters: DashMap<RoomId, u64>,
    index: DashMap<RoomId, BTreeSet<MessageId>>,
    invalidations: DashMap<RoomId, u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            messages: DashMap::new(),
            counters: DashMap::new(),
            index: DashMap::new(),
            invalidations: DashMap::new(),
        }
    }
}

impl MemoryStore {
    /// Create an empty store. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Fetch a stored message.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<DomainMessage> {
        self.messages.get(&id).map(|m| m.value().clone())
    }

    /// The room's danmu counter.
    #[must_use]
    pub fn room_counter(&self, room_id: &RoomId) -> u64 {
        self.counters.get(room_id).map(|c| *c).unwrap_or(0)
    }

    /// Ids indexed for a room, ascending.
    #[must_use]
    pub fn room_index(&self, room_id: &RoomId) -> Vec<MessageId> {
        self.index
            .get(room_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// How many times the room's cached aggregate was invalidated.
    #[must_use]
    pub fn invalidations(&self, room_id: &RoomId) -> u64 {
        self.invalidations.get(room_id).map(|c| *c).unwrap_or(0)
    }

    /// Visible history of a room ordered by time point, as a player would
    /// load it.
    #[must_use]
    pub fn history(&self, room_id: &RoomId) -> Vec<DomainMessage> {
        let mut history: Vec<DomainMessage> = self
            .room_index(room_id)
            .into_iter()
            .filter_map(|id| self.get(id))
            .filter(|m| m.danmu().status == danmu_protocol::Visibility::Visible)
            .collect();
        history.sort_by(|a, b| a.danmu().time_point.total_cmp(&b.danmu().time_point));
        history
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: &NewDanmu) -> Result<MessageId, CollaboratorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.messages.insert(id, message.clone().into_message(id));
        Ok(id)
    }

    async fn increment_room_counter(&self, room_id: &RoomId) -> Result<(), CollaboratorError> {
        *self.counters.entry(room_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn index_message(&self, room_id: &RoomId, id: MessageId) -> Result<(), CollaboratorError> {
        self.index.entry(room_id.clone()).or_default().insert(id);
        Ok(())
    }

    async fn invalidate_cached_aggregate(&self, room_id: &RoomId) -> Result<(), CollaboratorError> {
        *self.invalidations.entry(room_id.clone()).or_insert(0) += 1;
        Ok(())
    }
}
