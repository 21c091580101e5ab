//! JSON codec for danmu frames.
//!
//! Every frame travels as one WebSocket text message, so there is no
//! length prefix; the only framing rule is the size limit.

use thiserror::Error;

use crate::frames::{ClientFrame, Envelope};

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Binary frame that is not UTF-8 text.
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[source] std::str::Utf8Error),

    /// Frame contained nothing but whitespace.
    #[error("Empty frame")]
    Empty,

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error, including missing fields and wrong types.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

fn check_size(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    if text.trim().is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(())
}

/// Encode an envelope to JSON text.
///
/// # Errors
///
/// Returns an error if encoding fails or the result is too large.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope).map_err(ProtocolError::Encode)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an envelope, as a client would.
///
/// # Errors
///
/// Returns an error if the text is too large, empty, or not an envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    check_size(text)?;
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Encode a client frame.
///
/// # Errors
///
/// Returns an error if encoding fails or the result is too large.
pub fn encode_client(frame: &ClientFrame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(ProtocolError::Encode)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame received from a client.
///
/// # Errors
///
/// Returns an error if the text is too large, empty, or is missing
/// required fields.
pub fn decode_client(text: &str) -> Result<ClientFrame, ProtocolError> {
    check_size(text)?;
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Decode a client frame that arrived as raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are too large or not UTF-8, or if the
/// text does not decode.
pub fn decode_client_bytes(bytes: &[u8]) -> Result<ClientFrame, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    let text = std::str::from_utf8(bytes).map_err(ProtocolError::InvalidUtf8)?;
    decode_client(text)
}
