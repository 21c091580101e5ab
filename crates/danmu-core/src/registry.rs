//! Connection registry.
//!
//! The registry is the only owner of outbound send capability. Each attached
//! connection has a bounded queue; the transport drains it and performs the
//! actual socket write, so a send here never waits on a peer.

use crate::room::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// An encoded frame, shared between every recipient of a broadcast.
pub type Outbound = Arc<str>;

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// Receiving half of a connection's outbound queue, drained by the transport.
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Create a bounded outbound queue.
#[must_use]
pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Result of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued for the connection.
    Delivered,
    /// The connection's queue is full; the payload was dropped for it.
    Full,
    /// The connection's receiving side is gone.
    Closed,
    /// No such connection is registered.
    Gone,
}

impl SendOutcome {
    /// Whether the payload was enqueued.
    #[must_use]
    pub fn is_delivered(self) -> bool {
        self == SendOutcome::Delivered
    }
}

/// Map from connection id to its outbound queue.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, OutboundSender>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle, replacing any previous one for the same id.
    ///
    /// Returns the displaced handle, if any.
    pub fn register(&self, connection_id: ConnectionId, sender: OutboundSender) -> Option<OutboundSender> {
        debug!(connection = %connection_id, "Connection registered");
        self.connections.insert(connection_id, sender)
    }

    /// Store a handle unless the id is already registered.
    ///
    /// On conflict the handle is returned to the caller untouched.
    ///
    /// # Errors
    ///
    /// Returns the rejected sender when the id is taken.
    pub fn try_register(
        &self,
        connection_id: ConnectionId,
        sender: OutboundSender,
    ) -> Result<(), OutboundSender> {
        match self.connections.entry(connection_id) {
            Entry::Occupied(_) => Err(sender),
            Entry::Vacant(vacant) => {
                debug!(connection = %vacant.key(), "Connection registered");
                vacant.insert(sender);
                Ok(())
            }
        }
    }

    /// Remove a handle. Returns `false` if it was not registered.
    pub fn unregister(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.connections.remove(connection_id).is_some();
        if removed {
            debug!(connection = %connection_id, "Connection unregistered");
        }
        removed
    }

    /// Enqueue a payload for one connection.
    ///
    /// A missing connection is an expected race with detach, so every
    /// failure is reported as an outcome rather than an error.
    pub fn send(&self, connection_id: &ConnectionId, payload: Outbound) -> SendOutcome {
        let Some(sender) = self.connections.get(connection_id) else {
            trace!(connection = %connection_id, "Send to unregistered connection");
            return SendOutcome::Gone;
        };

        match sender.try_send(payload) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Check whether a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
