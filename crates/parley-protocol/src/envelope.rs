//! Envelope types for the Parley protocol.
//!
//! An envelope is one real-time message travelling over a live connection,
//! either a chat message or a call-signaling control message. Envelopes are
//! JSON objects tagged by their `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user identifier, as issued by the account service.
pub type UserId = i64;

/// A direct conversation identifier.
pub type ConversationId = i64;

/// A group chat identifier.
pub type GroupId = i64;

/// A persisted message identifier.
pub type MessageId = i64;

/// A call room identifier, chosen by the calling client.
pub type RoomId = String;

/// Envelope kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Message,
    GroupMessage,
    CallOffer,
    CallAnswer,
    CallReject,
    CallEnd,
    IceCandidate,
    Unknown,
}

impl EnvelopeKind {
    /// The wire name of this kind (the `type` field value).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::GroupMessage => "group_message",
            EnvelopeKind::CallOffer => "call_offer",
            EnvelopeKind::CallAnswer => "call_answer",
            EnvelopeKind::CallReject => "call_reject",
            EnvelopeKind::CallEnd => "call_end",
            EnvelopeKind::IceCandidate => "ice_candidate",
            EnvelopeKind::Unknown => "unknown",
        }
    }

    /// Whether this kind is a call-signaling control message.
    #[must_use]
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::CallOffer
                | EnvelopeKind::CallAnswer
                | EnvelopeKind::CallReject
                | EnvelopeKind::CallEnd
                | EnvelopeKind::IceCandidate
        )
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message, direct or group.
///
/// Inbound, clients fill in the target id, `content` and the optional media
/// reference. Outbound, the server adds the persisted id, the sender identity
/// and, for direct messages, the creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Persisted message id (outbound only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Target conversation for direct messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Target group for group messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    /// Message text.
    #[serde(default)]
    pub content: String,
    /// Optional attached media URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Optional attached media MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Sender id. Ignored inbound; the server uses the authenticated identity.
    #[serde(default)]
    pub sender_id: UserId,
    /// Sender display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    /// Sender avatar, when the directory knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar_url: Option<String>,
    /// Persistence timestamp (outbound only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Create a direct message addressed to a conversation.
    #[must_use]
    pub fn direct(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create a group message addressed to a group.
    #[must_use]
    pub fn group(group_id: GroupId, content: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Attach a media reference.
    #[must_use]
    pub fn with_media(mut self, url: impl Into<String>, media_type: impl Into<String>) -> Self {
        self.media_url = Some(url.into());
        self.media_type = Some(media_type.into());
        self
    }

    /// The target conversation, treating `0` as absent.
    #[must_use]
    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation_id.filter(|id| *id != 0)
    }

    /// The target group, treating `0` as absent.
    #[must_use]
    pub fn group_target(&self) -> Option<GroupId> {
        self.group_id.filter(|id| *id != 0)
    }

    /// The media URL, treating an empty string as absent.
    #[must_use]
    pub fn media_url(&self) -> Option<&str> {
        self.media_url.as_deref().filter(|s| !s.is_empty())
    }

    /// The media type, treating an empty string as absent.
    #[must_use]
    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref().filter(|s| !s.is_empty())
    }
}

/// A call-signaling control message.
///
/// `to` pins a single peer; `group_id` addresses a whole group. `room_id`
/// names the call room once a call is being established. The session
/// description and ICE candidate are opaque to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Sender id, stamped by the server.
    #[serde(default, alias = "from")]
    pub sender_id: UserId,
    /// Sender display name, stamped by the server.
    #[serde(default, alias = "caller_name", skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    /// Direct target user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    /// Target group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    /// Call room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// Session description (offer/answer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// ICE candidate payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,
}

impl Signal {
    /// Create a signal addressed to a single peer.
    #[must_use]
    pub fn to_user(to: UserId) -> Self {
        Self {
            to: Some(to),
            ..Self::default()
        }
    }

    /// Create a signal addressed to a group.
    #[must_use]
    pub fn to_group(group_id: GroupId) -> Self {
        Self {
            group_id: Some(group_id),
            ..Self::default()
        }
    }

    /// Set the room id.
    #[must_use]
    pub fn in_room(mut self, room_id: impl Into<RoomId>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Set the session description.
    #[must_use]
    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.sdp = Some(sdp.into());
        self
    }

    /// Set the ICE candidate.
    #[must_use]
    pub fn with_candidate(mut self, candidate: serde_json::Value) -> Self {
        self.candidate = Some(candidate);
        self
    }

    /// The direct target, treating `0` as absent.
    #[must_use]
    pub fn target(&self) -> Option<UserId> {
        self.to.filter(|id| *id != 0)
    }

    /// The target group, treating `0` as absent.
    #[must_use]
    pub fn group(&self) -> Option<GroupId> {
        self.group_id.filter(|id| *id != 0)
    }

    /// The room id, treating an empty string as absent.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Direct chat message.
    #[serde(rename = "message")]
    Message(ChatMessage),

    /// Group chat message.
    #[serde(rename = "group_message")]
    GroupMessage(ChatMessage),

    /// Call offer.
    #[serde(rename = "call_offer")]
    CallOffer(Signal),

    /// Call answer.
    #[serde(rename = "call_answer")]
    CallAnswer(Signal),

    /// Call rejected by the callee.
    #[serde(rename = "call_reject")]
    CallReject(Signal),

    /// Call hung up.
    #[serde(rename = "call_end")]
    CallEnd(Signal),

    /// ICE candidate exchange.
    #[serde(rename = "ice_candidate")]
    IceCandidate(Signal),

    /// Any `type` this server does not understand. Never acted upon.
    #[serde(rename = "unknown")]
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Get the envelope kind.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::GroupMessage(_) => EnvelopeKind::GroupMessage,
            Envelope::CallOffer(_) => EnvelopeKind::CallOffer,
            Envelope::CallAnswer(_) => EnvelopeKind::CallAnswer,
            Envelope::CallReject(_) => EnvelopeKind::CallReject,
            Envelope::CallEnd(_) => EnvelopeKind::CallEnd,
            Envelope::IceCandidate(_) => EnvelopeKind::IceCandidate,
            Envelope::Unknown => EnvelopeKind::Unknown,
        }
    }

    /// Build a signaling envelope of the given kind.
    ///
    /// Returns `None` if `kind` is not a signaling kind.
    #[must_use]
    pub fn signal(kind: EnvelopeKind, signal: Signal) -> Option<Self> {
        match kind {
            EnvelopeKind::CallOffer => Some(Envelope::CallOffer(signal)),
            EnvelopeKind::CallAnswer => Some(Envelope::CallAnswer(signal)),
            EnvelopeKind::CallReject => Some(Envelope::CallReject(signal)),
            EnvelopeKind::CallEnd => Some(Envelope::CallEnd(signal)),
            EnvelopeKind::IceCandidate => Some(Envelope::IceCandidate(signal)),
            _ => None,
        }
    }
}
