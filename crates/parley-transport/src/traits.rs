//! Transport abstraction traits for Parley.
//!
//! A live connection is split into a [`FrameSource`] (read half) and a
//! [`FrameSink`] (write half) so the inbound and outbound pumps can own one
//! half each and run concurrently.

use async_trait::async_trait;
use bytes::Bytes;
use parley_protocol::Payload;
use thiserror::Error;

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A text frame carrying one JSON envelope.
    Text(Payload),
    /// A binary frame. Clients may send envelopes as binary JSON.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness probe reply.
    Pong(Bytes),
}

impl Frame {
    /// Create a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Payload>) -> Self {
        Frame::Text(payload.into())
    }

    /// Create an empty ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping(Bytes::new())
    }

    /// Whether this frame is a heartbeat (ping or pong).
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Ping(_) | Frame::Pong(_))
    }

    /// Size of the frame body in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(p) => p.len(),
            Frame::Binary(b) | Frame::Ping(b) | Frame::Pong(b) => b.len(),
        }
    }

    /// Whether the frame body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// The write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_helpers() {
        let text = Frame::text("{\"type\":\"message\"}");
        assert_eq!(text.len(), 18);
        assert!(!text.is_heartbeat());

        let ping = Frame::ping();
        assert!(ping.is_heartbeat());
        assert!(ping.is_empty());
    }
}
