//! Envelope dispatch.
//!
//! Ties the registry, message router and room manager together and gives the
//! connection layer its three entry points: connect, dispatch, disconnect.

use crate::connection::{ConnectionHandle, Identity};
use crate::notify::{NoopNotifier, OfflineNotifier};
use crate::registry::{FanOut, Registry};
use crate::router::{MessageRouter, RouteOutcome};
use crate::signaling::RoomManager;
use crate::store::ChatStore;
use parley_protocol::{Envelope, Payload};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What became of one dispatched envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A chat message was routed.
    Chat(RouteOutcome),
    /// A signal was relayed.
    Signal(FanOut),
    /// The envelope type is not understood.
    Ignored,
}

/// Shared entry point for every live connection.
pub struct Dispatcher {
    registry: Arc<Registry>,
    rooms: Arc<RoomManager>,
    router: MessageRouter,
}

impl Dispatcher {
    /// Create a dispatcher over a store, discarding offline notifications.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self::with_notifier(store, Arc::new(NoopNotifier))
    }

    /// Create a dispatcher with an offline notifier.
    #[must_use]
    pub fn with_notifier(store: Arc<dyn ChatStore>, notifier: Arc<dyn OfflineNotifier>) -> Self {
        let registry = Arc::new(Registry::new(store.clone()));
        let rooms = Arc::new(RoomManager::new(registry.clone()).with_notifier(notifier.clone()));
        let router = MessageRouter::new(registry.clone(), store).with_notifier(notifier);
        Self {
            registry,
            rooms,
            router,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The call room table.
    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Create and register a connection for an authenticated user.
    ///
    /// Any previous connection of the same user is closed.
    pub fn connect(
        &self,
        identity: Identity,
        capacity: usize,
    ) -> (ConnectionHandle, mpsc::Receiver<Payload>) {
        let (handle, rx) = ConnectionHandle::new(identity, capacity);
        self.registry.register(handle.clone());
        (handle, rx)
    }

    /// Tear down a connection.
    ///
    /// Unregisters it only if it is still the user's current connection,
    /// removes it from every call room and closes it. Safe to call twice.
    pub fn disconnect(&self, handle: &ConnectionHandle) {
        let user_id = handle.user_id();
        let unregistered = self.registry.unregister_connection(user_id, handle.id());
        let rooms_left = self.rooms.leave_all(user_id, handle.id());
        handle.close();
        debug!(
            user_id,
            connection = %handle.id(),
            unregistered,
            rooms_left,
            "Connection torn down"
        );
    }

    /// Route one inbound envelope from `sender`.
    pub async fn dispatch(&self, sender: &ConnectionHandle, envelope: Envelope) -> Dispatched {
        let kind = envelope.kind();
        trace!(user_id = sender.user_id(), kind = %kind, "Dispatching envelope");

        match envelope {
            Envelope::Message(message) => {
                Dispatched::Chat(self.router.route_direct(sender, message).await)
            }
            Envelope::GroupMessage(message) => {
                Dispatched::Chat(self.router.route_group(sender, message).await)
            }
            Envelope::CallOffer(signal)
            | Envelope::CallAnswer(signal)
            | Envelope::CallReject(signal)
            | Envelope::CallEnd(signal)
            | Envelope::IceCandidate(signal) => {
                Dispatched::Signal(self.rooms.handle(sender, kind, signal).await)
            }
            Envelope::Unknown => {
                trace!(user_id = sender.user_id(), "Unknown envelope ignored");
                Dispatched::Ignored
            }
        }
    }
}
