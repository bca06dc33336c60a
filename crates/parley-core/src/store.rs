//! Persistence collaborator.
//!
//! The core never owns durable state. Message persistence, membership and the
//! user directory sit behind [`ChatStore`]; the router and registry call it
//! outside of any lock. [`MemoryStore`] is an in-process implementation for
//! tests and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{ConversationId, GroupId, MessageId, UserId};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The storage backend failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A chat message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Author.
    pub sender_id: UserId,
    /// Message text.
    pub content: String,
    /// Attached media URL.
    pub media_url: Option<String>,
    /// Attached media MIME type.
    pub media_type: Option<String>,
}

/// A persisted direct message's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedMessage {
    /// Message id.
    pub id: MessageId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Directory entry for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    /// Display name.
    pub display_name: String,
    /// Avatar URL.
    pub avatar_url: Option<String>,
}

/// Persistence and directory operations the core depends on.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a direct message.
    async fn save_direct_message(
        &self,
        conversation_id: ConversationId,
        message: &NewMessage,
    ) -> Result<SavedMessage, StoreError>;

    /// Persist a group message, returning its id.
    async fn save_group_message(
        &self,
        group_id: GroupId,
        message: &NewMessage,
    ) -> Result<MessageId, StoreError>;

    /// Members of a direct conversation.
    async fn list_conversation_members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, StoreError>;

    /// Members of a group.
    async fn list_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StoreError>;

    /// Whether a user currently belongs to a group.
    async fn is_group_member(&self, group_id: GroupId, user_id: UserId)
        -> Result<bool, StoreError>;

    /// Display name and avatar for a user.
    async fn lookup_display_name(&self, user_id: UserId) -> Result<UserProfile, StoreError>;
}

/// A message recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Message id.
    pub id: MessageId,
    /// Conversation or group the message was posted to.
    pub target: MessageTarget,
    /// Message body.
    pub message: NewMessage,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Where a stored message was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    /// A direct conversation.
    Conversation(ConversationId),
    /// A group.
    Group(GroupId),
}

/// In-memory [`ChatStore`].
#[derive(Debug)]
pub struct MemoryStore {
    users: DashMap<UserId, UserProfile>,
    conversations: DashMap<ConversationId, Vec<UserId>>,
    groups: DashMap<GroupId, Vec<UserId>>,
    messages: Mutex<Vec<StoredMessage>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            conversations: DashMap::new(),
            groups: DashMap::new(),
            messages: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Add or replace a user.
    pub fn add_user(&self, user_id: UserId, display_name: impl Into<String>) {
        self.users.insert(
            user_id,
            UserProfile {
                display_name: display_name.into(),
                avatar_url: None,
            },
        );
    }

    /// Set a user's avatar. Has no effect for unknown users.
    pub fn set_avatar(&self, user_id: UserId, avatar_url: impl Into<String>) {
        if let Some(mut profile) = self.users.get_mut(&user_id) {
            profile.avatar_url = Some(avatar_url.into());
        }
    }

    /// Add or replace a direct conversation.
    pub fn add_conversation(&self, conversation_id: ConversationId, members: &[UserId]) {
        self.conversations.insert(conversation_id, members.to_vec());
    }

    /// Add or replace a group.
    pub fn add_group(&self, group_id: GroupId, members: &[UserId]) {
        self.groups.insert(group_id, members.to_vec());
    }

    /// Remove a user from a group.
    pub fn remove_group_member(&self, group_id: GroupId, user_id: UserId) {
        if let Some(mut members) = self.groups.get_mut(&group_id) {
            members.retain(|m| *m != user_id);
        }
    }

    /// Make every subsequent write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// All persisted messages, oldest first.
    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().await.clone()
    }

    async fn append(
        &self,
        target: MessageTarget,
        message: &NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("writes disabled".to_string()));
        }

        let stored = StoredMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            target,
            message: message.clone(),
            created_at: Utc::now(),
        };
        self.messages.lock().await.push(stored.clone());
        Ok(stored)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_direct_message(
        &self,
        conversation_id: ConversationId,
        message: &NewMessage,
    ) -> Result<SavedMessage, StoreError> {
        let stored = self
            .append(MessageTarget::Conversation(conversation_id), message)
            .await?;
        Ok(SavedMessage {
            id: stored.id,
            created_at: stored.created_at,
        })
    }

    async fn save_group_message(
        &self,
        group_id: GroupId,
        message: &NewMessage,
    ) -> Result<MessageId, StoreError> {
        let stored = self.append(MessageTarget::Group(group_id), message).await?;
        Ok(stored.id)
    }

    async fn list_conversation_members(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .conversations
            .get(&conversation_id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    async fn list_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .groups
            .get(&group_id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    async fn is_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .groups
            .get(&group_id)
            .map(|m| m.contains(&user_id))
            .unwrap_or(false))
    }

    async fn lookup_display_name(&self, user_id: UserId) -> Result<UserProfile, StoreError> {
        self.users
            .get(&user_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(sender_id: UserId, content: &str) -> NewMessage {
        NewMessage {
            sender_id,
            content: content.to_string(),
            media_url: None,
            media_type: None,
        }
    }

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let first = store
            .save_direct_message(42, &new_message(1, "hi"))
            .await
            .unwrap();
        let second = store.save_group_message(7, &new_message(2, "yo")).await.unwrap();
        assert!(second > first.id);

        let messages = store.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].target, MessageTarget::Conversation(42));
        assert_eq!(messages[1].target, MessageTarget::Group(7));
    }

    #[tokio::test]
    async fn test_membership() {
        let store = MemoryStore::new();
        store.add_group(7, &[1, 2, 3]);

        assert!(store.is_group_member(7, 2).await.unwrap());
        store.remove_group_member(7, 2);
        assert!(!store.is_group_member(7, 2).await.unwrap());
        assert!(!store.is_group_member(8, 1).await.unwrap());
        assert!(store.list_conversation_members(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory() {
        let store = MemoryStore::new();
        store.add_user(1, "ann");
        store.set_avatar(1, "https://cdn/ann.png");

        let profile = store.lookup_display_name(1).await.unwrap();
        assert_eq!(profile.display_name, "ann");
        assert_eq!(profile.avatar_url.as_deref(), Some("https://cdn/ann.png"));
        assert!(matches!(
            store.lookup_display_name(2).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.save_group_message(7, &new_message(1, "x")).await,
            Err(StoreError::Backend(_))
        ));
        assert!(store.messages().await.is_empty());
    }
}
