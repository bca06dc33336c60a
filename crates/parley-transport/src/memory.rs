//! In-memory transport.
//!
//! A connected pair of channel halves standing in for a network stream. The
//! server side gets a [`MemorySource`] and a [`MemorySink`]; the client side
//! drives them through a [`MemoryPeer`]. Used to exercise connection pumps
//! without sockets.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{Frame, FrameSink, FrameSource, TransportError};

/// Create an in-memory connection.
///
/// `capacity` bounds the server-to-peer direction: once that many frames are
/// unread by the peer, [`MemorySink::send`] waits, like a stalled socket.
#[must_use]
pub fn duplex(capacity: usize) -> (MemorySink, MemorySource, MemoryPeer) {
    let (to_server, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_server) = mpsc::channel(capacity.max(1));

    (
        MemorySink { tx: Some(to_peer) },
        MemorySource { rx: from_peer },
        MemoryPeer {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

/// Server-side read half.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Server-side write half.
pub struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryPeer {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer hung up or the server dropped its read half.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(Ok(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::text(text.into()))
    }

    /// Make the server's next read fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn fail(&self, error: TransportError) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(Err(error))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the client-to-server direction; the server reads end-of-stream.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Receive the next frame from the server.
    ///
    /// Returns `None` once the server has closed its write half.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Receive a frame if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}
