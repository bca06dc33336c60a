//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`FrameSource`] and
//! [`FrameSink`] traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::Payload;
use tracing::{debug, trace};

use crate::traits::{Frame, FrameSink, FrameSource, TransportError};

/// Split an upgraded socket into its write and read halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WebSocketSink, WebSocketSource) {
    let (sink, stream) = socket.split();
    (
        WebSocketSink {
            inner: sink,
            closed: false,
        },
        WebSocketSource { inner: stream },
    )
}

/// The read half of a WebSocket connection.
pub struct WebSocketSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inner.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Frame::Text(Payload::from(text)))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Frame::Binary(Bytes::from(data)))),
            Some(Ok(Message::Ping(data))) => Ok(Some(Frame::Ping(Bytes::from(data)))),
            Some(Ok(Message::Pong(data))) => Ok(Some(Frame::Pong(Bytes::from(data)))),
            Some(Ok(Message::Close(frame))) => {
                debug!(reason = ?frame, "Received close frame");
                Ok(None)
            }
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

/// The write half of a WebSocket connection.
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Frame::Text(payload) => Message::Text(payload.as_str().to_owned()),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
            Frame::Ping(data) => Message::Ping(data.to_vec()),
            Frame::Pong(data) => Message::Pong(data.to_vec()),
        };

        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        trace!("Sending close frame");
        // The peer may already be gone; closing the sink still releases it.
        let _ = self.inner.send(Message::Close(None)).await;
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}
