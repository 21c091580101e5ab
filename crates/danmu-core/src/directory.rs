//! Room directory.
//!
//! Maps each room to the ids of its attached connections. Member sets are
//! copy-on-write: readers get an [`MemberSnapshot`] that later joins and
//! leaves never touch, so a broadcast can iterate it without holding any
//! lock.

use crate::room::{ConnectionId, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::hash_set;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Immutable point-in-time view of a room's members.
#[derive(Debug, Clone, Default)]
pub struct MemberSnapshot(Arc<HashSet<ConnectionId>>);

impl MemberSnapshot {
    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the room had no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check membership.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.0.contains(connection_id)
    }

    /// Iterate over member ids.
    pub fn iter(&self) -> hash_set::Iter<'_, ConnectionId> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a MemberSnapshot {
    type Item = &'a ConnectionId;
    type IntoIter = hash_set::Iter<'a, ConnectionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Room membership, sharded so unrelated rooms never contend.
///
/// A room exists exactly while it has at least one member.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: DashMap<RoomId, MemberSnapshot>,
}

impl RoomDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Idempotent. Returns the member count after the join.
    pub fn join(&self, room_id: &RoomId, connection_id: &ConnectionId) -> usize {
        self.join_then(room_id, connection_id, MemberSnapshot::len)
    }

    /// Add a connection to a room and run `f` on the resulting members
    /// while the room is still locked.
    ///
    /// Concurrent joins and leaves on the same room wait for `f`, which is
    /// what keeps membership notices in mutation order. `f` must not call
    /// back into the directory.
    pub fn join_then<R>(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        f: impl FnOnce(&MemberSnapshot) -> R,
    ) -> R {
        let mut entry = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            debug!(room = %room_id, "Creating room");
            MemberSnapshot::default()
        });

        if !entry.contains(connection_id) {
            Arc::make_mut(&mut entry.value_mut().0).insert(connection_id.clone());
            debug!(
                room = %room_id,
                connection = %connection_id,
                members = entry.len(),
                "Joined room"
            );
        }

        f(entry.value())
    }

    /// Remove a connection from a room, deleting the room once empty.
    ///
    /// No-op if the room or member is absent. Returns the member count
    /// after the leave.
    pub fn leave(&self, room_id: &RoomId, connection_id: &ConnectionId) -> usize {
        self.leave_then(room_id, connection_id, MemberSnapshot::len)
            .unwrap_or_else(|| self.member_count(room_id))
    }

    /// Remove a connection from a room and run `f` on the remaining members
    /// while the room is still locked.
    ///
    /// Returns `None` without calling `f` if the connection was not a
    /// member. `f` must not call back into the directory.
    pub fn leave_then<R>(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        f: impl FnOnce(&MemberSnapshot) -> R,
    ) -> Option<R> {
        let Entry::Occupied(mut occupied) = self.rooms.entry(room_id.clone()) else {
            return None;
        };

        if !occupied.get().contains(connection_id) {
            return None;
        }

        Arc::make_mut(&mut occupied.get_mut().0).remove(connection_id);
        debug!(
            room = %room_id,
            connection = %connection_id,
            members = occupied.get().len(),
            "Left room"
        );

        if occupied.get().is_empty() {
            occupied.remove();
            debug!(room = %room_id, "Deleted empty room");
            Some(f(&MemberSnapshot::default()))
        } else {
            Some(f(occupied.get()))
        }
    }

    /// Snapshot of a room's members; empty if the room does not exist.
    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> MemberSnapshot {
        self.rooms
            .get(room_id)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    /// Number of members in a room.
    #[must_use]
    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.members(room_id).len()
    }

    /// Whether a room entry exists.
    #[must_use]
    pub fn contains_room(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Number of non-empty rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Ids of all non-empty rooms.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::from("42")
    }

    #[test]
    fn test_join_is_idempotent() {
        let directory = RoomDirectory::new();

        assert_eq!(directory.join(&room(), &"a".into()), 1);
        assert_eq!(directory.join(&room(), &"a".into()), 1);
        assert_eq!(directory.join(&room(), &"b".into()), 2);
        assert_eq!(directory.member_count(&room()), 2);
    }

    #[test]
    fn test_last_leave_removes_room() {
        let directory = RoomDirectory::new();
        directory.join(&room(), &"a".into());
        directory.join(&room(), &"b".into());

        assert_eq!(directory.leave(&room(), &"a".into()), 1);
        assert!(directory.contains_room(&room()));

        assert_eq!(directory.leave(&room(), &"b".into()), 0);
        assert!(!directory.contains_room(&room()));
        assert_eq!(directory.room_count(), 0);
        assert!(directory.members(&room()).is_empty());
    }

    #[test]
    fn test_leave_absent_is_noop() {
        let directory = RoomDirectory::new();
        assert_eq!(directory.leave(&room(), &"a".into()), 0);
        assert!(!directory.contains_room(&room()));

        directory.join(&room(), &"a".into());
        assert!(directory
            .leave_then(&room(), &"stranger".into(), |_| ())
            .is_none());
        assert_eq!(directory.member_count(&room()), 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let directory = RoomDirectory::new();
        directory.join(&room(), &"a".into());
        directory.join(&room(), &"b".into());

        let snapshot = directory.members(&room());
        directory.join(&room(), &"c".into());
        directory.leave(&room(), &"a".into());

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&"a".into()));
        assert!(!snapshot.contains(&"c".into()));
        assert_eq!(directory.member_count(&room()), 2);
    }

    #[test]
    fn test_then_callbacks_see_post_mutation_members() {
        let directory = RoomDirectory::new();
        directory.join(&room(), &"a".into());

        let seen = directory.join_then(&room(), &"b".into(), |m| m.len());
        assert_eq!(seen, 2);

        let seen = directory.leave_then(&room(), &"a".into(), |m| m.contains(&"a".into()));
        assert_eq!(seen, Some(false));
    }

    #[test]
    fn test_rooms_are_independent() {
        let directory = RoomDirectory::new();
        directory.join(&"1".into(), &"a".into());
        directory.join(&"2".into(), &"b".into());
        directory.leave(&"1".into(), &"a".into());

        assert_eq!(directory.room_ids(), vec![RoomId::from("2")]);
    }

    #[test]
    fn test_concurrent_joins_are_not_lost() {
        let directory = RoomDirectory::new();
        let n = 64;

        std::thread::scope(|scope| {
            for i in 0..n {
                let directory = &directory;
                scope.spawn(move || {
                    directory.join(&room(), &ConnectionId::new(format!("conn-{i}")));
                });
            }
        });

        assert_eq!(directory.member_count(&room()), n);
    }

    #[test]
    fn test_concurrent_join_leave_leaves_no_phantoms() {
        let directory = RoomDirectory::new();

        std::thread::scope(|scope| {
            for i in 0..32 {
                let directory = &directory;
                scope.spawn(move || {
                    let id = ConnectionId::new(format!("conn-{i}"));
                    directory.join(&room(), &id);
                    // Odd connections detach again.
                    if i % 2 == 1 {
                        directory.leave(&room(), &id);
                    }
                });
            }
        });

        let members = directory.members(&room());
        assert_eq!(members.len(), 16);
        assert!(members.iter().all(|id| {
            let n: usize = id.as_str().trim_start_matches("conn-").parse().unwrap();
            n % 2 == 0
        }));
    }
}
