//! # Payload Serialization
//!
//! Frame payloads are encoded with bincode (1.x default configuration:
//! little-endian, fixed-width integers, length-prefixed sequences). The format
//! is self-describing enough for the receiver to know where each field ends,
//! which is why frames carry no separate length field.
//!
//! Any `Serialize + DeserializeOwned` type is a [`Payload`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Types that can travel as a frame payload
pub trait Payload {
    /// Serialize to payload bytes
    fn encode_payload(&self) -> Result<Vec<u8>>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from payload bytes
    fn decode_payload(data: &[u8]) -> Result<Self>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(data).map_err(ProtocolError::Serialization)
    }
}

impl<T: ?Sized> Payload for T {}
