//! Protocol codec for encoding/decoding messages
//!
//! Handles serialization and framing. Partial frames stay buffered until the
//! whole payload has arrived; a frame with an unknown type byte or an
//! oversized length is a protocol violation, not a recoverable condition.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::Message;

/// Maximum payload size (1 MiB) - a command list for one tick is small;
/// anything near this bound is a corrupt or hostile stream
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Header size: type(1) + length(4)
pub const HEADER_SIZE: usize = 5;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),

    #[error("payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Encodes messages into the wire format
#[derive(Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a message into a buffer
    pub fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(message)?;

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
        }

        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_u8(message.type_id());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(())
    }

    /// Encode a message into a fresh byte vector (used when one serialized
    /// form is broadcast to many slots)
    pub fn encode_to_vec(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Decodes messages from the wire format
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        message_type: u8,
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a message from the buffer.
    /// Returns Ok(None) if more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let message_type = buf[0];
                    if !Message::is_known_type(message_type) {
                        return Err(CodecError::UnknownType(message_type));
                    }

                    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
                    if length > MAX_PAYLOAD_SIZE {
                        return Err(CodecError::PayloadTooLarge(length, MAX_PAYLOAD_SIZE));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Payload {
                        message_type,
                        length,
                    };
                }
                DecodeState::Payload {
                    message_type,
                    length,
                } => {
                    if buf.len() < *length {
                        return Ok(None);
                    }

                    let expected_type = *message_type;
                    let payload = buf.split_to(*length);
                    let message: Message = bincode::deserialize(&payload)?;

                    self.state = DecodeState::Header;

                    // The header tag and the encoded variant must agree
                    if message.type_id() != expected_type {
                        return Err(CodecError::UnknownType(expected_type));
                    }

                    return Ok(Some(message));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
