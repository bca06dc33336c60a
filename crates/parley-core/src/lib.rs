//! # parley-core
//!
//! Connection registry, chat routing and call signaling for the Parley
//! real-time engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Connection** - Handle to one live stream: identity, outbound queue, close signal
//! - **Registry** - Which user is connected where; last connection wins
//! - **Router** - Persists chat messages and fans them out to members
//! - **Signaling** - Relays call-control envelopes through ephemeral call rooms
//! - **Dispatch** - Routes each inbound envelope by kind
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│ Dispatcher  │────▶│   Router    │──┐
//! └─────────────┘     └─────────────┘     └─────────────┘  │
//!        ▲                   │                             ▼
//!        │                   ▼                      ┌─────────────┐
//!        │            ┌─────────────┐               │  ChatStore  │
//!        │            │ RoomManager │               └─────────────┘
//!        │            └─────────────┘
//!        │                   │
//!        │                   ▼
//!        │            ┌─────────────┐
//!        └────────────│  Registry   │
//!                     └─────────────┘
//! ```

pub mod connection;
pub mod dispatch;
pub mod notify;
pub mod registry;
pub mod router;
pub mod signaling;
pub mod store;

pub use connection::{ConnectionHandle, ConnectionId, Delivery, Identity, DEFAULT_QUEUE_CAPACITY};
pub use dispatch::{Dispatched, Dispatcher};
pub use notify::{LogNotifier, NoopNotifier, OfflineNotifier};
pub use registry::{FanOut, Registry};
pub use router::{DropReason, MessageRouter, RouteOutcome};
pub use signaling::{CallRoom, RoomManager};
pub use store::{ChatStore, MemoryStore, NewMessage, SavedMessage, StoreError, UserProfile};
