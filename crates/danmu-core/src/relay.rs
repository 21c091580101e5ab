//! The relay: entry point for transport events.
//!
//! A transport reports three events per connection: attach, payload and
//! detach. The relay keeps the registry and the directory in step for each
//! of them and emits viewer-count notices from inside the room's critical
//! section, so every member sees counts in the order membership changed.

use crate::broadcaster::{Broadcaster, DeliveryReport};
use crate::collab::Collaborators;
use crate::directory::{MemberSnapshot, RoomDirectory};
use crate::pipeline::{Accepted, MessagePipeline, PipelineConfig, Rejection};
use crate::registry::{outbound_channel, ConnectionRegistry, OutboundReceiver};
use crate::room::{ConnectionId, RoomId};
use danmu_protocol::{codec, Envelope};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The connection id is still attached.
    #[error("Connection already attached: {0}")]
    ConnectionInUse(ConnectionId),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Acceptance pipeline settings.
    pub pipeline: PipelineConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// A successful attach.
#[derive(Debug)]
pub struct Attached {
    /// Queue the transport must drain into the socket.
    pub receiver: OutboundReceiver,
    /// Members in the room after the join.
    pub viewers: usize,
    /// Fan-out of the viewer notice.
    pub notice: DeliveryReport,
}

/// The outcome of a detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    /// Members left in the room.
    pub viewers: usize,
    /// Fan-out of the viewer notice; empty when nothing changed or the
    /// room emptied.
    pub notice: DeliveryReport,
}

/// Relay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Attached connections.
    pub connections: usize,
}

/// Room-scoped danmu relay.
///
/// Built once at startup and shared by every connection task.
pub struct Relay {
    directory: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    pipeline: MessagePipeline,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_config(collaborators, RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(collaborators: Collaborators, config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        let directory = Arc::new(RoomDirectory::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&directory), Arc::clone(&registry));
        let pipeline = MessagePipeline::new(collaborators, broadcaster.clone(), config.pipeline.clone());

        Self {
            directory,
            registry,
            broadcaster,
            pipeline,
            config,
        }
    }

    /// Attach a connection to a room.
    ///
    /// Every member, the new one included, is sent the new viewer count.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection id is already attached.
    pub fn attach(&self, room_id: &RoomId, connection_id: &ConnectionId) -> Result<Attached, RelayError> {
        let (sender, receiver) = outbound_channel(self.config.outbound_capacity);

        if self
            .registry
            .try_register(connection_id.clone(), sender)
            .is_err()
        {
            warn!(room = %room_id, connection = %connection_id, "Connection id already attached");
            return Err(RelayError::ConnectionInUse(connection_id.clone()));
        }

        let (viewers, notice) = self.directory.join_then(room_id, connection_id, |members| {
            (members.len(), self.notify_viewers(room_id, members))
        });

        debug!(room = %room_id, connection = %connection_id, viewers, "Attached");
        Ok(Attached {
            receiver,
            viewers,
            notice,
        })
    }

    /// Run an inbound text payload through the acceptance pipeline.
    ///
    /// # Errors
    ///
    /// Returns the rejection; the sender has already been told.
    pub async fn on_payload(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        raw: &str,
    ) -> Result<Accepted, Rejection> {
        self.pipeline.process(room_id, connection_id, raw).await
    }

    /// Run an inbound binary payload through the acceptance pipeline.
    ///
    /// # Errors
    ///
    /// Returns the rejection, including non-UTF-8 input; the sender has
    /// already been told.
    pub async fn on_binary_payload(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        raw: &[u8],
    ) -> Result<Accepted, Rejection> {
        self.pipeline.process_bytes(room_id, connection_id, raw).await
    }

    /// Detach a connection and tell the remaining members.
    ///
    /// Idempotent. The connection leaves its room before its id is
    /// released, so a re-attach under the same id cannot overlap it.
    pub fn detach(&self, room_id: &RoomId, connection_id: &ConnectionId) -> Detached {
        let detached = self
            .directory
            .leave_then(room_id, connection_id, |members| Detached {
                viewers: members.len(),
                notice: self.notify_viewers(room_id, members),
            })
            .unwrap_or_else(|| Detached {
                viewers: self.directory.member_count(room_id),
                notice: DeliveryReport::default(),
            });

        self.registry.unregister(connection_id);

        debug!(room = %room_id, connection = %connection_id, viewers = detached.viewers, "Detached");
        detached
    }

    /// Snapshot of a room's members.
    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> MemberSnapshot {
        self.directory.members(room_id)
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            rooms: self.directory.room_count(),
            connections: self.registry.len(),
        }
    }

    fn notify_viewers(&self, room_id: &RoomId, members: &MemberSnapshot) -> DeliveryReport {
        if members.is_empty() {
            return DeliveryReport::default();
        }

        match codec::encode(&Envelope::viewers(members.len())) {
            Ok(text) => self.broadcaster.deliver(members, Arc::from(text)),
            Err(e) => {
                error!(room = %room_id, error = %e, "Failed to encode viewer notice");
                DeliveryReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, StaticVerifier};
    use danmu_protocol::decode;
    use serde_json::json;

    fn relay() -> (Fixture, Relay) {
        let fixture = Fixture::new();
        let relay = Relay::new(fixture.collaborators());
        (fixture, relay)
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(decode(&text).unwrap());
        }
        out
    }

    fn viewer_counts(rx: &mut OutboundReceiver) -> Vec<usize> {
        drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                Envelope::Notice { viewers, .. } => viewers,
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_attach_notifies_every_member() {
        let (_, relay) = relay();
        let room = RoomId::from("42");

        let mut rx_a = relay.attach(&room, &"a".into()).unwrap().receiver;
        let mut rx_b = relay.attach(&room, &"b".into()).unwrap().receiver;
        assert_eq!(viewer_counts(&mut rx_a), vec![1, 2]);
        assert_eq!(viewer_counts(&mut rx_b), vec![2]);

        let mut rx_c = relay.attach(&room, &"c".into()).unwrap().receiver;
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(drain(rx), vec![Envelope::viewers(3)]);
        }
    }

    #[test]
    fn test_detach_notifies_remaining_members() {
        let (_, relay) = relay();
        let room = RoomId::from("42");

        let mut rx_a = relay.attach(&room, &"a".into()).unwrap().receiver;
        let mut rx_b = relay.attach(&room, &"b".into()).unwrap().receiver;
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(relay.detach(&room, &"b".into()).viewers, 1);
        assert_eq!(drain(&mut rx_a), vec![Envelope::viewers(1)]);
        assert!(drain(&mut rx_b).is_empty());

        // Repeated detach changes nothing and sends nothing.
        assert_eq!(relay.detach(&room, &"b".into()).viewers, 1);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_last_detach_removes_room() {
        let (_, relay) = relay();
        let room = RoomId::from("42");

        let _rx = relay.attach(&room, &"a".into()).unwrap().receiver;
        assert_eq!(relay.stats(), RelayStats { rooms: 1, connections: 1 });

        assert_eq!(relay.detach(&room, &"a".into()).viewers, 0);
        assert_eq!(relay.stats(), RelayStats { rooms: 0, connections: 0 });
        assert!(relay.members(&room).is_empty());
    }

    #[test]
    fn test_duplicate_connection_id_is_refused() {
        let (_, relay) = relay();

        let _rx = relay.attach(&"1".into(), &"a".into()).unwrap().receiver;
        assert!(matches!(
            relay.attach(&"2".into(), &"a".into()),
            Err(RelayError::ConnectionInUse(_))
        ));
        assert_eq!(relay.stats(), RelayStats { rooms: 1, connections: 1 });
    }

    #[test]
    fn test_membership_matches_attached_connections() {
        let (_, relay) = relay();
        let room = RoomId::from("42");
        let mut receivers = Vec::new();

        for i in 0..10 {
            receivers.push(relay.attach(&room, &ConnectionId::new(format!("c{i}"))).unwrap().receiver);
        }
        for i in (0..10).step_by(3) {
            relay.detach(&room, &ConnectionId::new(format!("c{i}")));
        }

        assert_eq!(relay.members(&room).len(), 6);
        assert_eq!(relay.stats().connections, 6);
    }

    #[test]
    fn test_concurrent_attach_counts_are_monotonic() {
        let fixture = Fixture::new();
        let relay = Relay::with_config(
            fixture.collaborators(),
            RelayConfig {
                outbound_capacity: 64,
                ..RelayConfig::default()
            },
        );
        let room = RoomId::from("42");
        let n = 32;

        let receivers: Vec<OutboundReceiver> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..n)
                .map(|i| {
                    let relay = &relay;
                    let room = &room;
                    scope.spawn(move || relay.attach(room, &ConnectionId::new(format!("c{i}"))).unwrap().receiver)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(relay.members(&room).len(), n);
        for mut rx in receivers {
            let counts = viewer_counts(&mut rx);
            assert!(counts.windows(2).all(|w| w[0] < w[1]), "stale count in {counts:?}");
            assert_eq!(counts.last(), Some(&n));
        }
    }

    #[tokio::test]
    async fn test_danmu_reaches_room_and_counter() {
        let (fixture, relay) = relay();
        let room = RoomId::from("42");

        let mut rx_a = relay.attach(&room, &"a".into()).unwrap().receiver;
        let mut rx_b = relay.attach(&room, &"b".into()).unwrap().receiver;
        let mut rx_other = relay.attach(&"7".into(), &"z".into()).unwrap().receiver;
        for rx in [&mut rx_a, &mut rx_b, &mut rx_other] {
            drain(rx);
        }

        let raw = json!({
            "token": format!("Bearer {}", StaticVerifier::VALID),
            "data": {"content": "hello", "fontsize": 25, "mode": 1, "color": "#FFFFFF", "timePoint": 12.5}
        })
        .to_string();
        relay.on_payload(&room, &"a".into(), &raw).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match drain(rx).as_slice() {
                [Envelope::Message(record)] => {
                    assert_eq!(record.content, "hello");
                    assert_eq!(record.time_point, 12.5);
                }
                other => panic!("expected one message, got {other:?}"),
            }
        }
        assert!(drain(&mut rx_other).is_empty());
        assert_eq!(fixture.store.room_counter(&room), 1);
    }

    #[test]
    fn test_dead_member_does_not_affect_notices() {
        let (_, relay) = relay();
        let room = RoomId::from("42");

        let mut rx_a = relay.attach(&room, &"a".into()).unwrap().receiver;
        let mut rx_b = relay.attach(&room, &"b".into()).unwrap().receiver;
        let rx_dead = relay.attach(&room, &"dead".into()).unwrap().receiver;
        drop(rx_dead);
        drain(&mut rx_a);
        drain(&mut rx_b);

        let attached = relay.attach(&room, &"c".into()).unwrap();
        assert_eq!(attached.viewers, 4);
        assert_eq!(attached.notice.attempted, 4);
        assert_eq!(attached.notice.failed(), 1);
        assert_eq!(drain(&mut rx_a), vec![Envelope::viewers(4)]);
        assert_eq!(drain(&mut rx_b), vec![Envelope::viewers(4)]);

        // Removed by its own detach, not by the broadcast.
        assert!(relay.members(&room).contains(&"dead".into()));
        let detached = relay.detach(&room, &"dead".into());
        assert_eq!(detached.viewers, 3);
        assert_eq!(detached.notice.delivered, 3);
        assert_eq!(drain(&mut rx_a), vec![Envelope::viewers(3)]);

        // Nothing left to do, nothing sent.
        assert_eq!(relay.detach(&room, &"dead".into()).notice, DeliveryReport::default());
    }

    #[test]
    fn test_reattach_cannot_interleave_with_detach() {
        let (_, relay) = relay();
        let room = RoomId::from("42");
        let a = ConnectionId::from("a");

        let _rx_b = relay.attach(&room, &"b".into()).unwrap().receiver;
        let _rx_a = relay.attach(&room, &a).unwrap().receiver;

        // First half of a detach: the id has left the room but is still
        // registered, so a reconnect under it is refused.
        relay.directory.leave(&room, &a);
        assert!(matches!(
            relay.attach(&room, &a),
            Err(RelayError::ConnectionInUse(_))
        ));
        assert!(relay.registry.contains(&a));
        assert!(!relay.members(&room).contains(&a));

        relay.registry.unregister(&a);
        let mut rx = relay.attach(&room, &a).unwrap().receiver;
        assert!(relay.registry.contains(&a));
        assert!(relay.members(&room).contains(&a));
        assert_eq!(drain(&mut rx), vec![Envelope::viewers(2)]);
    }

    #[tokio::test]
    async fn test_binary_payload_must_be_utf8() {
        let (fixture, relay) = relay();
        let room = RoomId::from("42");
        let mut rx_a = relay.attach(&room, &"a".into()).unwrap().receiver;
        let mut rx_b = relay.attach(&room, &"b".into()).unwrap().receiver;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let rejection = relay
            .on_binary_payload(&room, &"a".into(), &[b'{', 0xFF, 0xFE, b'}'])
            .await
            .unwrap_err();

        assert_eq!(rejection.kind(), "malformed");
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [Envelope::Error { code: danmu_protocol::codes::MALFORMED, .. }]
        ));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(fixture.store.message_count(), 0);
    }
}
