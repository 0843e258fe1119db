//! # Core Protocol Components
//!
//! Frame layout and payload serialization.
//!
//! ## Components
//! - **Codec**: one-byte type discriminator plus payload, with a size ceiling
//! - **Serialization**: bincode payload encoding
//!
//! ## Wire Format
//! ```text
//! [Type(1)] [Payload(N)]
//! ```
//! The WebSocket message delimits the frame; no length prefix is needed.
//!
//! ## Safety
//! - Frames above the configured maximum are rejected before parsing
//! - Unknown discriminators and malformed payloads are decode errors, never panics

pub mod codec;
pub mod serialization;

pub use codec::{MessageCodec, MessageType};
