//! # parley-transport
//!
//! Transport abstraction layer for the Parley real-time core.
//!
//! A live connection is handed to the core as two halves:
//!
//! - [`FrameSource`] - the read half, owned by the inbound pump
//! - [`FrameSink`] - the write half, owned by the outbound pump
//!
//! Implementations:
//!
//! - **WebSocket** - axum upgraded sockets (feature `websocket`)
//! - **Memory** - in-process channels, for tests and embedding
//!
//! ```rust,ignore
//! use parley_transport::{FrameSource, FrameSink};
//!
//! async fn echo(mut source: impl FrameSource, mut sink: impl FrameSink) {
//!     while let Ok(Some(frame)) = source.recv().await {
//!         if sink.send(frame).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Frame, FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketSink, WebSocketSource};
