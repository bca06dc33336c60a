//! Offline notification hook.
//!
//! When a real-time delivery finds no live connection for a recipient, the
//! core hands the envelope to an [`OfflineNotifier`]. Push delivery itself
//! lives outside the core.

use async_trait::async_trait;
use parley_protocol::{Envelope, UserId};
use tracing::debug;

/// Receives envelopes that could not be delivered in real time.
#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    /// Called once per offline recipient.
    async fn notify_offline(&self, user_id: UserId, envelope: &Envelope);
}

/// Discards offline notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl OfflineNotifier for NoopNotifier {
    async fn notify_offline(&self, _user_id: UserId, _envelope: &Envelope) {}
}

/// Logs offline notifications at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl OfflineNotifier for LogNotifier {
    async fn notify_offline(&self, user_id: UserId, envelope: &Envelope) {
        debug!(user_id, kind = %envelope.kind(), "Recipient offline, push notification due");
    }
}
