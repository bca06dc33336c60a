//! Connection handles.
//!
//! A [`ConnectionHandle`] is the shareable side of one live stream: the
//! authenticated identity, the producer end of the bounded outbound queue,
//! and a close signal. The stream itself is owned by the connection's pumps.

use parley_protocol::{Payload, UserId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Default outbound queue capacity per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An authenticated user, as handed over by the upgrade layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id.
    pub user_id: UserId,
    /// Display name.
    pub display_name: String,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued on the recipient's outbound queue.
    Queued,
    /// The recipient's queue was full or closing; the payload was dropped.
    Dropped,
    /// The recipient has no live connection.
    Offline,
}

#[derive(Debug)]
struct Inner {
    id: ConnectionId,
    identity: Identity,
    tx: mpsc::Sender<Payload>,
    closed: watch::Sender<bool>,
    dropped: AtomicU64,
}

/// Shareable handle to one live connection.
///
/// Cloning is cheap. Handles are held by the registry and by call rooms;
/// producers only ever use [`ConnectionHandle::try_send`], which never blocks.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Create a handle and the consumer end of its outbound queue.
    #[must_use]
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);

        let handle = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                identity,
                tx,
                closed,
                dropped: AtomicU64::new(0),
            }),
        };
        (handle, rx)
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Authenticated user id.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.inner.identity.user_id
    }

    /// Authenticated display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.inner.identity.display_name
    }

    /// The full identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Enqueue a payload without waiting.
    ///
    /// A full queue drops the payload: real-time delivery favours the
    /// liveness of the producer over completeness for one slow recipient.
    pub fn try_send(&self, payload: Payload) -> Delivery {
        if self.is_closed() {
            return Delivery::Dropped;
        }

        match self.inner.tx.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(
                    connection = %self.inner.id,
                    user_id = self.user_id(),
                    "Outbound queue full, payload dropped"
                );
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Dropped,
        }
    }

    /// Signal both pumps of this connection to shut down.
    ///
    /// Returns `true` if this call closed the connection, `false` if it was
    /// already closed.
    pub fn close(&self) -> bool {
        let was_closed = self.inner.closed.send_replace(true);
        if !was_closed {
            debug!(connection = %self.inner.id, user_id = self.user_id(), "Connection closing");
        }
        !was_closed
    }

    /// Whether [`ConnectionHandle::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // The sender lives in `inner`, so this only errors if it was dropped,
        // which cannot happen while `self` is alive.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of payloads dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn test_full_queue_drops() {
        let (handle, mut rx) = ConnectionHandle::new(Identity::new(1, "ann"), 2);

        assert_eq!(handle.try_send(Payload::from("a")), Delivery::Queued);
        assert_eq!(handle.try_send(Payload::from("b")), Delivery::Queued);
        assert_eq!(handle.try_send(Payload::from("c")), Delivery::Dropped);
        assert_eq!(handle.dropped_count(), 1);

        assert_eq!(rx.try_recv().unwrap().as_str(), "a");
        assert_eq!(rx.try_recv().unwrap().as_str(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (handle, _rx) = ConnectionHandle::new(Identity::new(1, "ann"), 4);
        assert!(!handle.is_closed());
        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
        assert_eq!(handle.try_send(Payload::from("late")), Delivery::Dropped);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (handle, _rx) = ConnectionHandle::new(Identity::new(1, "ann"), 4);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };
        tokio::task::yield_now().await;
        handle.close();
        waiter.await.unwrap();

        // Already closed: resolves immediately.
        handle.closed().await;
    }

    #[test]
    fn test_dropped_receiver() {
        let (handle, rx) = ConnectionHandle::new(Identity::new(1, "ann"), 4);
        drop(rx);
        assert_eq!(handle.try_send(Payload::from("x")), Delivery::Dropped);
        assert_eq!(handle.dropped_count(), 0);
    }
}
