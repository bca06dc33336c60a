//! # parley-protocol
//!
//! Wire envelope definitions for the Parley real-time chat and call-signaling
//! core.
//!
//! Every frame on a live connection carries one JSON envelope tagged by its
//! `type` field.
//!
//! ## Envelope Types
//!
//! - `message` / `group_message` - Direct and group chat
//! - `call_offer` / `call_answer` / `call_reject` / `call_end` - Call control
//! - `ice_candidate` - ICE candidate exchange
//!
//! Unknown types decode to [`Envelope::Unknown`] and are ignored.
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ChatMessage, Envelope};
//!
//! let envelope = Envelope::Message(ChatMessage::direct(42, "hi"));
//!
//! let payload = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(payload.as_bytes()).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, decode_with_limit, encode, Payload, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{
    ChatMessage, ConversationId, Envelope, EnvelopeKind, GroupId, MessageId, RoomId, Signal,
    UserId,
};
