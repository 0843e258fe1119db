//! # Error Types
//!
//! Error handling for the mutator client.
//!
//! This module defines every error variant the client can surface, from local
//! transport failures to service-level rejections.
//!
//! ## Error Categories
//! - **Decode Errors**: malformed or unrecognized inbound frames (logged, frame dropped)
//! - **Service Errors**: authentication rejected, initialization failed
//! - **Connection Errors**: not connected, connection closed while waiting, timeouts
//! - **Local Errors**: configuration and input loading failures
//!
//! Authentication and initialization failures are normal outcomes; callers are
//! expected to match on them rather than treat them as crashes.
//!
//! ## Example Usage
//! ```rust
//! use mutator_client::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn check(status: u32) -> Result<()> {
//!     if status != 0 {
//!         return Err(ProtocolError::InitFailed(status));
//!     }
//!     Ok(())
//! }
//!
//! match check(7) {
//!     Ok(()) => info!("initialized"),
//!     Err(e) => error!(error = %e, "initialization failed"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants shared by log lines and error payloads.
pub mod constants {
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_EMPTY_FRAME: &str = "Empty frame";
    pub const ERR_IO_THREAD_SPAWN: &str = "Failed to spawn I/O thread";
    pub const ERR_RUNTIME_BUILD: &str = "Failed to build I/O runtime";
    pub const ERR_BLOCKING_ON_IO_THREAD: &str = "Blocking call issued from the I/O thread";
    pub const ERR_IO_THREAD_PANICKED: &str = "I/O thread panicked";
    pub const ERR_HANDLER_PANICKED: &str = "Handler panicked";
}

// ProtocolError is the single error type for all client operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("A blocking call is already in flight")]
    CallInFlight,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Authentication rejected with status {0}")]
    AuthRejected(u32),

    #[error("Initialization failed with status {0}")]
    InitFailed(u32),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Input error: {0}")]
    Input(String),
}

impl ProtocolError {
    /// Status code reported by the service, if this error carries one.
    pub fn status(&self) -> Option<u32> {
        match self {
            ProtocolError::AuthRejected(status) | ProtocolError::InitFailed(status) => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
