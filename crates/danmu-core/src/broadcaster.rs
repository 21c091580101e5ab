//! Room fan-out.

use crate::directory::{MemberSnapshot, RoomDirectory};
use crate::registry::{ConnectionRegistry, Outbound, SendOutcome};
use crate::room::{ConnectionId, RoomId};
use std::sync::Arc;
use tracing::{trace, warn};

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Members the payload was addressed to.
    pub attempted: usize,
    /// Members whose queue accepted the payload.
    pub delivered: usize,
    /// Members whose queue was full or closed.
    pub dropped: usize,
    /// Members that detached between snapshot and send.
    pub gone: usize,
}

impl DeliveryReport {
    /// Number of members that did not receive the payload.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }

    fn record(&mut self, outcome: SendOutcome) {
        self.attempted += 1;
        match outcome {
            SendOutcome::Delivered => self.delivered += 1,
            SendOutcome::Full | SendOutcome::Closed => self.dropped += 1,
            SendOutcome::Gone => self.gone += 1,
        }
    }
}

/// Sends payloads to every member of a room.
///
/// Dead members are skipped, never removed: cleanup belongs to the
/// member's own detach.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    directory: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over shared stores.
    #[must_use]
    pub fn new(directory: Arc<RoomDirectory>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            directory,
            registry,
        }
    }

    /// Send a payload to every current member of a room.
    pub fn broadcast(&self, room_id: &RoomId, payload: Outbound) -> DeliveryReport {
        let members = self.directory.members(room_id);
        let report = self.deliver(&members, payload);
        trace!(
            room = %room_id,
            recipients = report.attempted,
            delivered = report.delivered,
            "Broadcast"
        );
        report
    }

    /// Send a payload to every connection in a snapshot.
    ///
    /// A failed send never stops delivery to the remaining members.
    pub fn deliver(&self, members: &MemberSnapshot, payload: Outbound) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for connection_id in members {
            let outcome = self.registry.send(connection_id, Arc::clone(&payload));
            match outcome {
                SendOutcome::Delivered => {}
                SendOutcome::Full => {
                    warn!(connection = %connection_id, "Outbound queue full, dropping payload");
                }
                SendOutcome::Closed => {
                    warn!(connection = %connection_id, "Outbound queue closed");
                }
                SendOutcome::Gone => {
                    trace!(connection = %connection_id, "Member detached before send");
                }
            }
            report.record(outcome);
        }

        report
    }

    /// Send a payload to a single connection.
    pub fn send_to(&self, connection_id: &ConnectionId, payload: Outbound) -> SendOutcome {
        self.registry.send(connection_id, payload)
    }
}
