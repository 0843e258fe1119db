//! Frame codec.
//!
//! A frame is a single raw discriminator byte followed immediately by the
//! bincode-encoded payload. There is no length field: the WebSocket message
//! boundary delimits the frame and the discriminator is always exactly one byte.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use crate::config::MAX_FRAME_SIZE;
use crate::core::serialization::Payload;
use crate::error::{constants, ProtocolError, Result};

/// Discriminator identifying which payload variant a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Auth = 0,
    Init = 1,
    CreateInstance = 2,
    Mutate = 3,
    Callback = 4,
}

impl MessageType {
    /// Wire byte for this type
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte; `None` if out of the known range
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageType::Auth),
            1 => Some(MessageType::Init),
            2 => Some(MessageType::CreateInstance),
            3 => Some(MessageType::Mutate),
            4 => Some(MessageType::Callback),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Auth => "auth",
            MessageType::Init => "init",
            MessageType::CreateInstance => "create_instance",
            MessageType::Mutate => "mutate",
            MessageType::Callback => "callback",
        }
    }

    /// Whether replies of this type resolve a blocking call rather than a push
    pub fn is_blocking(self) -> bool {
        matches!(self, MessageType::Auth | MessageType::Init)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encodes and decodes `[type][payload]` frames with a size ceiling on input.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a typed payload into a frame
    pub fn encode<T: Serialize>(&self, kind: MessageType, payload: &T) -> Result<Bytes> {
        let body = payload.encode_payload()?;
        let mut frame = BytesMut::with_capacity(1 + body.len());
        frame.put_u8(kind.as_byte());
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Split a frame into its type and raw payload bytes
    pub fn split<'a>(&self, frame: &'a [u8]) -> Result<(MessageType, &'a [u8])> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(frame.len()));
        }

        let (&first, payload) = frame
            .split_first()
            .ok_or_else(|| ProtocolError::Decode(constants::ERR_EMPTY_FRAME.to_string()))?;

        let kind = MessageType::from_byte(first)
            .ok_or_else(|| ProtocolError::Decode(format!("Unknown message type: {first}")))?;

        Ok((kind, payload))
    }

    /// Decode a frame whose payload type is known up front
    pub fn decode<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<(MessageType, T)> {
        let (kind, payload) = self.split(frame)?;
        let value = T::decode_payload(payload)
            .map_err(|e| ProtocolError::Decode(format!("Malformed {kind} payload: {e}")))?;
        Ok((kind, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: u32,
        name: String,
    }

    #[test]
    fn discriminator_is_a_single_raw_byte() {
        let codec = MessageCodec::default();
        let frame = codec
            .encode(MessageType::Mutate, &Probe { id: 7, name: "x".into() })
            .expect("encode");
        assert_eq!(frame[0], 3);
        // a textual rendering would have produced b'3'
        assert_ne!(frame[0], b'3');
    }

    #[test]
    fn type_byte_roundtrip() {
        for byte in 0u8..=4 {
            let kind = MessageType::from_byte(byte).expect("known type");
            assert_eq!(kind.as_byte(), byte);
        }
        assert_eq!(MessageType::from_byte(5), None);
        assert_eq!(MessageType::from_byte(b'0'), None);
    }

    #[test]
    fn decode_recovers_type_and_payload() {
        let codec = MessageCodec::default();
        let probe = Probe { id: 42, name: "session".into() };
        let frame = codec.encode(MessageType::CreateInstance, &probe).expect("encode");
        let (kind, decoded): (MessageType, Probe) = codec.decode(&frame).expect("decode");
        assert_eq!(kind, MessageType::CreateInstance);
        assert_eq!(decoded, probe);
    }

    #[test]
    fn empty_frame_is_a_decode_error() {
        let codec = MessageCodec::default();
        assert!(matches!(
            codec.split(&[]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn unknown_discriminator_is_a_decode_error() {
        let codec = MessageCodec::default();
        let result = codec.decode::<Probe>(&[0xFF, 0, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let codec = MessageCodec::default();
        let frame = codec
            .encode(MessageType::Auth, &Probe { id: 1, name: "abcdef".into() })
            .expect("encode");
        let result = codec.decode::<Probe>(&frame[..frame.len() - 3]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn oversized_frame_is_rejected_before_parsing() {
        let codec = MessageCodec::new(8);
        let result = codec.split(&[0u8; 9]);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge(9))));
    }

    #[test]
    fn only_auth_and_init_are_blocking() {
        assert!(MessageType::Auth.is_blocking());
        assert!(MessageType::Init.is_blocking());
        assert!(!MessageType::CreateInstance.is_blocking());
        assert!(!MessageType::Mutate.is_blocking());
        assert!(!MessageType::Callback.is_blocking());
    }
}
