//! Chat message router.
//!
//! Persists each inbound chat envelope, resolves its recipients and pushes
//! the formatted result through the registry, echoing it back to the sender.

use crate::connection::{ConnectionHandle, Delivery};
use crate::notify::{NoopNotifier, OfflineNotifier};
use crate::registry::{FanOut, Registry};
use crate::store::{ChatStore, NewMessage, UserProfile};
use parley_protocol::{codec, ChatMessage, Envelope, MessageId, Payload};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Why a chat envelope was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No conversation or group id.
    MissingTarget,
    /// The sender does not belong to the group.
    NotMember,
    /// The store failed; nothing was delivered.
    StoreFailure,
    /// The outbound envelope could not be encoded.
    EncodeFailure,
}

impl DropReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MissingTarget => "missing_target",
            DropReason::NotMember => "not_member",
            DropReason::StoreFailure => "store_failure",
            DropReason::EncodeFailure => "encode_failure",
        }
    }
}

/// Result of routing one chat envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Persisted and fanned out.
    Delivered {
        /// Persisted message id.
        message_id: MessageId,
        /// Delivery to recipients other than the sender.
        recipients: FanOut,
        /// Self-echo to the sender.
        echo: Delivery,
    },
    /// Dropped without delivery.
    Dropped(DropReason),
}

/// Routes direct and group chat messages.
pub struct MessageRouter {
    registry: Arc<Registry>,
    store: Arc<dyn ChatStore>,
    notifier: Arc<dyn OfflineNotifier>,
}

impl MessageRouter {
    /// Create a router that discards offline notifications.
    #[must_use]
    pub fn new(registry: Arc<Registry>, store: Arc<dyn ChatStore>) -> Self {
        Self {
            registry,
            store,
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Use a custom offline notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn OfflineNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Route a direct message.
    pub async fn route_direct(&self, sender: &ConnectionHandle, message: ChatMessage) -> RouteOutcome {
        let user_id = sender.user_id();
        let Some(conversation_id) = message.conversation() else {
            debug!(user_id, "Direct message without conversation id dropped");
            return RouteOutcome::Dropped(DropReason::MissingTarget);
        };

        let new_message = new_message(user_id, &message);
        let saved = match self
            .store
            .save_direct_message(conversation_id, &new_message)
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                warn!(user_id, conversation_id, error = %e, "Failed to save direct message");
                return RouteOutcome::Dropped(DropReason::StoreFailure);
            }
        };

        // The message is already persisted; a failed lookup still echoes.
        let members = match self.store.list_conversation_members(conversation_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(user_id, conversation_id, error = %e, "Failed to load conversation members");
                Vec::new()
            }
        };

        let profile = self.sender_profile(sender).await;
        let envelope = Envelope::Message(ChatMessage {
            id: Some(saved.id),
            conversation_id: Some(conversation_id),
            group_id: None,
            content: new_message.content,
            media_url: new_message.media_url,
            media_type: new_message.media_type,
            sender_id: user_id,
            sender_username: Some(profile.display_name),
            sender_avatar_url: profile.avatar_url,
            created_at: Some(saved.created_at),
        });
        let Some(payload) = encode(&envelope) else {
            return RouteOutcome::Dropped(DropReason::EncodeFailure);
        };

        let mut recipients = FanOut::default();
        for member in members.into_iter().filter(|m| *m != user_id) {
            recipients.record(member, self.registry.send_to_user(member, &payload));
        }
        let echo = sender.try_send(payload);

        self.notify_offline(&recipients, &envelope).await;

        trace!(
            user_id,
            conversation_id,
            message_id = saved.id,
            queued = recipients.queued,
            "Direct message routed"
        );
        RouteOutcome::Delivered {
            message_id: saved.id,
            recipients,
            echo,
        }
    }

    /// Route a group message.
    pub async fn route_group(&self, sender: &ConnectionHandle, message: ChatMessage) -> RouteOutcome {
        let user_id = sender.user_id();
        let Some(group_id) = message.group_target() else {
            debug!(user_id, "Group message without group id dropped");
            return RouteOutcome::Dropped(DropReason::MissingTarget);
        };

        match self.store.is_group_member(group_id, user_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(user_id, group_id, "Sender is not a group member");
                return RouteOutcome::Dropped(DropReason::NotMember);
            }
            Err(e) => {
                warn!(user_id, group_id, error = %e, "Failed to check group membership");
                return RouteOutcome::Dropped(DropReason::StoreFailure);
            }
        }

        let new_message = new_message(user_id, &message);
        let message_id = match self.store.save_group_message(group_id, &new_message).await {
            Ok(id) => id,
            Err(e) => {
                warn!(user_id, group_id, error = %e, "Failed to save group message");
                return RouteOutcome::Dropped(DropReason::StoreFailure);
            }
        };

        let profile = self.sender_profile(sender).await;
        let envelope = Envelope::GroupMessage(ChatMessage {
            id: Some(message_id),
            conversation_id: None,
            group_id: Some(group_id),
            content: new_message.content,
            media_url: new_message.media_url,
            media_type: new_message.media_type,
            sender_id: user_id,
            sender_username: Some(profile.display_name),
            sender_avatar_url: profile.avatar_url,
            created_at: None,
        });
        let Some(payload) = encode(&envelope) else {
            return RouteOutcome::Dropped(DropReason::EncodeFailure);
        };

        // The message is already persisted; a failed fan-out still echoes.
        let recipients = match self
            .registry
            .send_to_group_members(group_id, user_id, &payload)
            .await
        {
            Ok(fan_out) => fan_out,
            Err(e) => {
                warn!(user_id, group_id, error = %e, "Failed to load group members");
                FanOut::default()
            }
        };
        let echo = sender.try_send(payload);

        self.notify_offline(&recipients, &envelope).await;

        trace!(
            user_id,
            group_id,
            message_id,
            queued = recipients.queued,
            "Group message routed"
        );
        RouteOutcome::Delivered {
            message_id,
            recipients,
            echo,
        }
    }

    /// Directory entry for the sender, falling back to the authenticated name.
    async fn sender_profile(&self, sender: &ConnectionHandle) -> UserProfile {
        match self.store.lookup_display_name(sender.user_id()).await {
            Ok(profile) => profile,
            Err(e) => {
                debug!(user_id = sender.user_id(), error = %e, "Display name lookup failed");
                UserProfile {
                    display_name: sender.display_name().to_string(),
                    avatar_url: None,
                }
            }
        }
    }

    async fn notify_offline(&self, recipients: &FanOut, envelope: &Envelope) {
        for user_id in &recipients.offline {
            self.notifier.notify_offline(*user_id, envelope).await;
        }
    }
}

fn new_message(sender_id: parley_protocol::UserId, message: &ChatMessage) -> NewMessage {
    NewMessage {
        sender_id,
        content: message.content.clone(),
        media_url: message.media_url().map(str::to_string),
        media_type: message.media_type().map(str::to_string),
    }
}

fn encode(envelope: &Envelope) -> Option<Payload> {
    match codec::encode(envelope) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(kind = %envelope.kind(), error = %e, "Failed to encode outbound envelope");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Identity;
    use crate::store::{MemoryStore, MessageTarget};
    use async_trait::async_trait;
    use parley_protocol::UserId;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<Registry>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.add_user(1, "ann");
        store.add_user(2, "bob");
        store.add_user(3, "cyd");
        store.add_conversation(42, &[1, 2]);
        store.add_group(7, &[1, 2, 3]);

        let registry = Arc::new(Registry::new(store.clone()));
        let router = MessageRouter::new(registry.clone(), store.clone());
        Fixture {
            store,
            registry,
            router,
        }
    }

    fn connect(registry: &Registry, user_id: UserId) -> (ConnectionHandle, mpsc::Receiver<Payload>) {
        let (handle, rx) = ConnectionHandle::new(Identity::new(user_id, "authname"), 16);
        registry.register(handle.clone());
        (handle, rx)
    }

    fn received(rx: &mut mpsc::Receiver<Payload>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(payload.decode().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_direct_message_scenario() {
        let f = fixture();
        let (ann, mut ann_rx) = connect(&f.registry, 1);
        let (_bob, mut bob_rx) = connect(&f.registry, 2);

        let outcome = f
            .router
            .route_direct(&ann, ChatMessage::direct(42, "hi"))
            .await;
        assert!(matches!(
            outcome,
            RouteOutcome::Delivered {
                echo: Delivery::Queued,
                ..
            }
        ));

        let stored = f.store.messages().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].target, MessageTarget::Conversation(42));
        assert_eq!(stored[0].message.sender_id, 1);
        assert_eq!(stored[0].message.content, "hi");

        let bob_got = received(&mut bob_rx);
        let ann_got = received(&mut ann_rx);
        assert_eq!(bob_got.len(), 1);
        assert_eq!(bob_got, ann_got);

        match &bob_got[0] {
            Envelope::Message(msg) => {
                assert_eq!(msg.conversation_id, Some(42));
                assert_eq!(msg.content, "hi");
                assert_eq!(msg.sender_id, 1);
                assert_eq!(msg.sender_username.as_deref(), Some("ann"));
                assert_eq!(msg.id, Some(stored[0].id));
                assert!(msg.created_at.is_some());
            }
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_direct_message_echoes_when_recipient_offline() {
        let f = fixture();
        let (ann, mut ann_rx) = connect(&f.registry, 1);

        match f.router.route_direct(&ann, ChatMessage::direct(42, "anyone?")).await {
            RouteOutcome::Delivered { recipients, echo, .. } => {
                assert_eq!(recipients.offline, vec![2]);
                assert_eq!(echo, Delivery::Queued);
            }
            other => panic!("Expected Delivered, got {:?}", other),
        }
        assert_eq!(received(&mut ann_rx).len(), 1);
        assert_eq!(f.store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_direct_message_from_outsider_delivered() {
        let f = fixture();
        let (cyd, mut cyd_rx) = connect(&f.registry, 3);
        let (_bob, mut bob_rx) = connect(&f.registry, 2);

        match f.router.route_direct(&cyd, ChatMessage::direct(42, "psst")).await {
            RouteOutcome::Delivered { recipients, echo, .. } => {
                assert_eq!(recipients.queued, 1);
                assert_eq!(recipients.offline, vec![1]);
                assert_eq!(echo, Delivery::Queued);
            }
            other => panic!("Expected Delivered, got {:?}", other),
        }
        assert_eq!(f.store.messages().await.len(), 1);
        assert_eq!(received(&mut bob_rx).len(), 1);
        assert_eq!(received(&mut cyd_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_message_near_inbound_limit_still_echoed() {
        let f = fixture();
        let (ann, mut ann_rx) = connect(&f.registry, 1);
        let (_bob, mut bob_rx) = connect(&f.registry, 2);

        let content = "x".repeat(parley_protocol::MAX_FRAME_SIZE - 100);
        let outcome = f
            .router
            .route_direct(&ann, ChatMessage::direct(42, content.clone()))
            .await;
        assert!(matches!(
            outcome,
            RouteOutcome::Delivered {
                echo: Delivery::Queued,
                ..
            }
        ));
        assert_eq!(f.store.messages().await.len(), 1);

        for rx in [&mut ann_rx, &mut bob_rx] {
            match &received(rx)[..] {
                [Envelope::Message(msg)] => assert_eq!(msg.content, content),
                other => panic!("Expected one Message, got {} envelopes", other.len()),
            }
        }
    }

    #[tokio::test]
    async fn test_missing_target_dropped() {
        let f = fixture();
        let (ann, _rx) = connect(&f.registry, 1);

        let outcome = f.router.route_direct(&ann, ChatMessage::direct(0, "?")).await;
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::MissingTarget));
        let outcome = f.router.route_group(&ann, ChatMessage::default()).await;
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::MissingTarget));
    }

    #[tokio::test]
    async fn test_group_message_fans_out_and_echoes() {
        let f = fixture();
        let (ann, mut ann_rx) = connect(&f.registry, 1);
        let (_bob, mut bob_rx) = connect(&f.registry, 2);
        let (_cyd, mut cyd_rx) = connect(&f.registry, 3);

        let message = ChatMessage::group(7, "team").with_media("https://cdn/x.png", "image/png");
        let outcome = f.router.route_group(&ann, message).await;
        match outcome {
            RouteOutcome::Delivered { recipients, .. } => assert_eq!(recipients.queued, 2),
            other => panic!("Expected Delivered, got {:?}", other),
        }

        for rx in [&mut ann_rx, &mut bob_rx, &mut cyd_rx] {
            let got = received(rx);
            assert_eq!(got.len(), 1);
            match &got[0] {
                Envelope::GroupMessage(msg) => {
                    assert_eq!(msg.group_id, Some(7));
                    assert_eq!(msg.media_type.as_deref(), Some("image/png"));
                    assert_eq!(msg.sender_username.as_deref(), Some("ann"));
                }
                other => panic!("Expected GroupMessage, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_group_message_from_non_member_dropped() {
        let f = fixture();
        f.store.remove_group_member(7, 3);
        let (cyd, mut cyd_rx) = connect(&f.registry, 3);
        let (_ann, mut ann_rx) = connect(&f.registry, 1);

        let outcome = f.router.route_group(&cyd, ChatMessage::group(7, "let me in")).await;
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::NotMember));
        assert!(f.store.messages().await.is_empty());
        assert!(received(&mut ann_rx).is_empty());
        assert!(received(&mut cyd_rx).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_drops_message() {
        let f = fixture();
        f.store.set_fail_writes(true);
        let (ann, mut ann_rx) = connect(&f.registry, 1);
        let (_bob, mut bob_rx) = connect(&f.registry, 2);

        let outcome = f.router.route_direct(&ann, ChatMessage::direct(42, "lost")).await;
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::StoreFailure));
        assert!(received(&mut ann_rx).is_empty());
        assert!(received(&mut bob_rx).is_empty());
        assert!(!ann.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_sender_uses_authenticated_name() {
        let f = fixture();
        f.store.add_conversation(43, &[1, 50]);
        let (stranger, mut rx) = {
            let (handle, rx) = ConnectionHandle::new(Identity::new(50, "fresh"), 4);
            f.registry.register(handle.clone());
            (handle, rx)
        };

        f.router.route_direct(&stranger, ChatMessage::direct(43, "hey")).await;
        match &received(&mut rx)[0] {
            Envelope::Message(msg) => assert_eq!(msg.sender_username.as_deref(), Some("fresh")),
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<UserId>>,
    }

    #[async_trait]
    impl OfflineNotifier for RecordingNotifier {
        async fn notify_offline(&self, user_id: UserId, _envelope: &Envelope) {
            self.calls.lock().unwrap().push(user_id);
        }
    }

    #[tokio::test]
    async fn test_offline_recipients_notified() {
        let f = fixture();
        let notifier = Arc::new(RecordingNotifier::default());
        let router = MessageRouter::new(f.registry.clone(), f.store.clone())
            .with_notifier(notifier.clone());
        let (ann, _rx) = connect(&f.registry, 1);

        router.route_group(&ann, ChatMessage::group(7, "hello")).await;
        let mut calls = notifier.calls.lock().unwrap().clone();
        calls.sort_unstable();
        assert_eq!(calls, vec![2, 3]);
    }
}
