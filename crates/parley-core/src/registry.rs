//! Connection registry.
//!
//! Maps each user id to its single current connection. The last connection
//! to register wins; the one it replaces is signalled to close.

use crate::connection::{ConnectionHandle, ConnectionId, Delivery};
use crate::store::{ChatStore, StoreError};
use dashmap::DashMap;
use parley_protocol::{GroupId, Payload, UserId};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Outcome of a fan-out to several recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Recipients whose queue accepted the payload.
    pub queued: usize,
    /// Recipients whose queue was full or closing.
    pub dropped: usize,
    /// Recipients with no live connection.
    pub offline: Vec<UserId>,
}

impl FanOut {
    /// Record the delivery result for one recipient.
    pub fn record(&mut self, user_id: UserId, delivery: Delivery) {
        match delivery {
            Delivery::Queued => self.queued += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Offline => self.offline.push(user_id),
        }
    }

    /// Total recipients attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.queued + self.dropped + self.offline.len()
    }
}

/// The process-wide connection registry.
///
/// Constructed once at startup and shared by reference with every
/// connection. The map is sharded; lookups take shared shard locks and
/// register/unregister take exclusive ones. Nothing awaits while a shard lock
/// is held.
pub struct Registry {
    /// Current connection per user.
    connections: DashMap<UserId, ConnectionHandle>,
    /// Membership lookups for group fan-out.
    store: Arc<dyn ChatStore>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
            store,
        }
    }

    /// Register a connection as its user's current one.
    ///
    /// If the user already had a different live connection, it is replaced,
    /// signalled to close and returned.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user_id = handle.user_id();
        let connection = handle.id();
        let previous = self.connections.insert(user_id, handle);

        match previous {
            Some(old) if old.id() != connection => {
                old.close();
                debug!(
                    user_id,
                    connection = %connection,
                    superseded = %old.id(),
                    "Connection replaced"
                );
                Some(old)
            }
            _ => {
                debug!(user_id, connection = %connection, "Connection registered");
                None
            }
        }
    }

    /// Remove a user's mapping, whatever connection it points at.
    ///
    /// Idempotent.
    pub fn unregister(&self, user_id: UserId) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(&user_id).map(|(_, h)| h);
        if removed.is_some() {
            debug!(user_id, "Connection unregistered");
        }
        removed
    }

    /// Remove a user's mapping only if it still points at `connection`.
    ///
    /// A replaced connection tearing down late must not evict its successor.
    /// Returns `true` if the mapping was removed.
    pub fn unregister_connection(&self, user_id: UserId, connection: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(&user_id, |_, handle| handle.id() == connection)
            .is_some();
        if removed {
            debug!(user_id, connection = %connection, "Connection unregistered");
        }
        removed
    }

    /// Get a user's current connection.
    #[must_use]
    pub fn get(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|e| e.value().clone())
    }

    /// Whether the user has a live connection.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    /// Number of users with a live connection.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Deliver a payload to one user without waiting.
    pub fn send_to_user(&self, user_id: UserId, payload: &Payload) -> Delivery {
        // Clone the handle out so the shard lock is released before enqueueing.
        match self.get(user_id) {
            Some(handle) => handle.try_send(payload.clone()),
            None => {
                trace!(user_id, "Recipient offline");
                Delivery::Offline
            }
        }
    }

    /// Deliver a payload to every member of a group except `exclude_user_id`.
    ///
    /// The member list is fetched from the store and snapshotted before any
    /// send, so a slow recipient never holds up resolution of the rest.
    ///
    /// # Errors
    ///
    /// Returns an error if the member list cannot be fetched; nothing is sent.
    pub async fn send_to_group_members(
        &self,
        group_id: GroupId,
        exclude_user_id: UserId,
        payload: &Payload,
    ) -> Result<FanOut, StoreError> {
        let members = self.store.list_group_members(group_id).await?;

        let mut fan_out = FanOut::default();
        for member in members.into_iter().filter(|m| *m != exclude_user_id) {
            fan_out.record(member, self.send_to_user(member, payload));
        }

        trace!(
            group_id,
            queued = fan_out.queued,
            dropped = fan_out.dropped,
            offline = fan_out.offline.len(),
            "Group fan-out"
        );
        Ok(fan_out)
    }
}
