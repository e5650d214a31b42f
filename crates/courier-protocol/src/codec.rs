//! Codecs for Courier events.
//!
//! Two encodings carry the same `{"event", "data"}` object:
//!
//! - **Text**: a JSON document per WebSocket text frame (browser clients).
//! - **Binary**: a 4-byte big-endian length prefix followed by a
//!   MessagePack-encoded event, for native clients.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Which encoding a frame used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    Text,
    /// Length-prefixed MessagePack frames.
    Binary,
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a value as a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode one length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Encode a value as a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_text<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(value)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a valid event.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelMessagePayload, ClientEvent, PingPayload, ServerEvent};
    use crate::ids::RawUserId;

    fn sample_message() -> ClientEvent {
        ClientEvent::ChannelMessage(ChannelMessagePayload {
            channel_id: Some("chnl_general".into()),
            sender_id: Some(RawUserId::Number(1)),
            content: Some("hi".into()),
            file_ids: vec!["file_1".into()],
        })
    }

    #[test]
    fn test_binary_and_text_carry_same_event() {
        let event = sample_message();

        let binary: ClientEvent = decode(&encode(&event).unwrap()).unwrap();
        let text: ClientEvent = decode_text(&encode_text(&event).unwrap()).unwrap();

        assert_eq!(binary, event);
        assert_eq!(text, event);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&ServerEvent::error("nope")).unwrap();

        match decode::<ServerEvent>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let huge = ServerEvent::error("x".repeat(MAX_FRAME_SIZE + 1));

        match encode(&huge) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::Ping(PingPayload { timestamp: Some(1) });
        let second = sample_message();

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        let decoded1: ClientEvent = decode_from(&mut buf).unwrap().unwrap();
        let decoded2: ClientEvent = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(first, decoded1);
        assert_eq!(second, decoded2);
        assert!(buf.is_empty());
        assert!(decode_from::<ClientEvent>(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result = decode_text::<ClientEvent>(r#"{"event":"launchMissiles","data":{}}"#);
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }
}
