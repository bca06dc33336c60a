//! Codec for encoding and decoding Parley envelopes.
//!
//! Envelopes travel as JSON text, one envelope per transport frame.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An encoded envelope, ready to be written to any number of connections.
///
/// Cloning is cheap; the underlying buffer is shared. The contents are always
/// valid UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    /// Get the payload as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only constructed from `String`s, so this never falls back.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode this payload back into an envelope, regardless of its size.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid envelope.
    pub fn decode(&self) -> Result<Envelope, ProtocolError> {
        decode_with_limit(&self.0, self.0.len())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(Bytes::from(text))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Self(Bytes::from_static(text.as_bytes()))
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode an envelope to a payload.
///
/// Outbound envelopes are not size-limited; they carry server-added fields on
/// top of an inbound frame that already passed the inbound limit.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Payload, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    Ok(Payload::from(text))
}

/// Decode an envelope from a frame.
///
/// Unknown `type` values decode to [`Envelope::Unknown`].
///
/// # Errors
///
/// Returns an error if the frame is too large or not a JSON envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Decode an envelope from a frame with a caller-supplied size limit.
///
/// # Errors
///
/// Returns an error if the frame exceeds `max_size` or is not a JSON envelope.
pub fn decode_with_limit(data: &[u8], max_size: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::FrameTooLarge(data.len(), max_size));
    }

    let envelope = serde_json::from_slice(data)?;
    Ok(envelope)
}
